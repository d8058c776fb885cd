//! Test doubles and builders shared by unit and integration tests.
//!
//! The mock scheduler-core records every outbound request and answers
//! asynchronously through the registered callback, like the real remote
//! peer would. The mock orchestrator records bind/delete calls and exposes
//! controllable watch streams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::{ClusterNode, Pod, PodPhase, WatchEvent};
use crate::client::{OrchestratorClient, PodWatch, VolumeBinder};
use crate::common::{Resource, ResourceBuilder};
use crate::constants::{labels, DEFAULT_PARTITION, DEFAULT_SCHEDULER_NAME};
use crate::core::callback::RmCallback;
use crate::core::types::{
    Allocation, AllocationAsk, AllocationRelease, RegisterRequest, UpdateRequest,
};
use crate::core::SchedulerApi;
use crate::error::{Result, ShimError};

// ---- builders ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            pod: Pod {
                uid: name.to_string(),
                name: name.to_string(),
                namespace: "default".to_string(),
                scheduler_name: DEFAULT_SCHEDULER_NAME.to_string(),
                service_account: "default".to_string(),
                labels: HashMap::new(),
                annotations: HashMap::new(),
                node_name: None,
                phase: PodPhase::Pending,
                resources: Resource::new(),
            },
        }
    }

    pub fn uid(mut self, uid: &str) -> Self {
        self.pod.uid = uid.to_string();
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.pod.namespace = namespace.to_string();
        self
    }

    pub fn scheduler_name(mut self, name: &str) -> Self {
        self.pod.scheduler_name = name.to_string();
        self
    }

    pub fn service_account(mut self, account: &str) -> Self {
        self.pod.service_account = account.to_string();
        self
    }

    pub fn app_id(self, application_id: &str) -> Self {
        self.label(labels::APPLICATION_ID, application_id)
    }

    pub fn queue(self, queue: &str) -> Self {
        self.label(labels::QUEUE_NAME, queue)
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.pod
            .annotations
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn phase(mut self, phase: PodPhase) -> Self {
        self.pod.phase = phase;
        self
    }

    pub fn node(mut self, node_name: &str) -> Self {
        self.pod.node_name = Some(node_name.to_string());
        self
    }

    pub fn cpu_milli(mut self, millicores: i64) -> Self {
        self.pod.resources.set(crate::constants::resources::CPU, millicores);
        self
    }

    pub fn memory_mi(mut self, mebibytes: i64) -> Self {
        self.pod
            .resources
            .set(crate::constants::resources::MEMORY, mebibytes * 1024 * 1024);
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

pub fn node_for_test(name: &str, cpu_milli: i64, memory_mi: i64) -> ClusterNode {
    ClusterNode {
        name: name.to_string(),
        uid: format!("uid-{name}"),
        unschedulable: false,
        capacity: ResourceBuilder::new()
            .cpu_milli(cpu_milli)
            .memory_mi(memory_mi)
            .build(),
    }
}

// ---- mock failures -------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockFailure {
    pub message: String,
    pub retriable: bool,
}

impl MockFailure {
    pub fn transient(message: &str) -> Self {
        Self {
            message: message.to_string(),
            retriable: true,
        }
    }

    pub fn permanent(message: &str) -> Self {
        Self {
            message: message.to_string(),
            retriable: false,
        }
    }

    fn into_error(self) -> ShimError {
        if self.retriable {
            ShimError::Transient(self.message)
        } else {
            ShimError::Permanent(self.message)
        }
    }
}

// ---- mock scheduler-core -------------------------------------------------

/// In-process stand-in for the remote scheduler-core. Requests are
/// recorded; decisions are pushed back through the [`RmCallback`] from a
/// separate task with a small delay, mimicking RPC asynchrony.
pub struct MockSchedulerApi {
    updates: Arc<Mutex<Vec<UpdateRequest>>>,
    registrations: Arc<Mutex<Vec<RegisterRequest>>>,
    reloads: Arc<Mutex<Vec<String>>>,
    callback: Arc<Mutex<Option<Arc<RmCallback>>>>,
    rejected_applications: Arc<Mutex<HashSet<String>>>,
    hold_accepts: Arc<AtomicBool>,
    allocation_plan: Arc<Mutex<HashMap<String, String>>>,
    minted: Arc<Mutex<Vec<Allocation>>>,
    register_failures_remaining: Arc<AtomicUsize>,
}

impl Default for MockSchedulerApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSchedulerApi {
    pub fn new() -> Self {
        Self {
            updates: Arc::new(Mutex::new(Vec::new())),
            registrations: Arc::new(Mutex::new(Vec::new())),
            reloads: Arc::new(Mutex::new(Vec::new())),
            callback: Arc::new(Mutex::new(None)),
            rejected_applications: Arc::new(Mutex::new(HashSet::new())),
            hold_accepts: Arc::new(AtomicBool::new(false)),
            allocation_plan: Arc::new(Mutex::new(HashMap::new())),
            minted: Arc::new(Mutex::new(Vec::new())),
            register_failures_remaining: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_callback(&self, callback: Arc<RmCallback>) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Make the core place `allocation_key` onto `node` when its ask
    /// arrives.
    pub fn plan_allocation(&self, allocation_key: &str, node: &str) {
        self.allocation_plan
            .lock()
            .unwrap()
            .insert(allocation_key.to_string(), node.to_string());
    }

    pub fn reject_application(&self, application_id: &str) {
        self.rejected_applications
            .lock()
            .unwrap()
            .insert(application_id.to_string());
    }

    /// Suspend accept/reject responses, keeping submitted applications in
    /// flight (used by recovery tests).
    pub fn hold_accepts(&self, hold: bool) {
        self.hold_accepts.store(hold, Ordering::SeqCst);
    }

    pub fn fail_registrations(&self, count: usize) {
        self.register_failures_remaining
            .store(count, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<UpdateRequest> {
        self.updates.lock().unwrap().clone()
    }

    pub fn registrations(&self) -> Vec<RegisterRequest> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn reloads(&self) -> Vec<String> {
        self.reloads.lock().unwrap().clone()
    }

    pub fn asks(&self) -> Vec<AllocationAsk> {
        self.updates()
            .into_iter()
            .flat_map(|u| u.asks)
            .collect()
    }

    pub fn releases(&self) -> Vec<AllocationRelease> {
        self.updates()
            .into_iter()
            .flat_map(|u| u.releases)
            .collect()
    }

    pub fn minted_allocations(&self) -> Vec<Allocation> {
        self.minted.lock().unwrap().clone()
    }

    /// Allocation UUIDs the core still believes are live for an
    /// application: minted minus released.
    pub fn outstanding_allocations(&self, application_id: &str) -> Vec<String> {
        let released: HashSet<String> = self
            .releases()
            .into_iter()
            .filter(|r| r.application_id == application_id)
            .map(|r| r.allocation_uuid)
            .collect();
        self.minted_allocations()
            .into_iter()
            .filter(|a| a.application_id == application_id && !released.contains(&a.uuid))
            .map(|a| a.uuid)
            .collect()
    }
}

#[async_trait]
impl SchedulerApi for MockSchedulerApi {
    async fn register(&self, request: RegisterRequest) -> Result<()> {
        self.registrations.lock().unwrap().push(request);
        let remaining = self.register_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.register_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ShimError::transient("scheduler-core unavailable"));
        }
        Ok(())
    }

    async fn update(&self, request: UpdateRequest) -> Result<()> {
        self.updates.lock().unwrap().push(request.clone());

        let callback = self.callback.lock().unwrap().clone();
        let Some(callback) = callback else {
            return Ok(());
        };
        let rejected = self.rejected_applications.lock().unwrap().clone();
        let hold = self.hold_accepts.clone();
        let plan = self.allocation_plan.lock().unwrap().clone();
        let minted = self.minted.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;

            for app in &request.new_applications {
                if hold.load(Ordering::SeqCst) {
                    continue;
                }
                if rejected.contains(&app.application_id) {
                    callback.application_rejected(&app.application_id, "unknown queue");
                } else {
                    callback.application_accepted(&app.application_id);
                }
            }

            for node in &request.new_nodes {
                callback.node_accepted(&node.node_id);
            }

            for ask in &request.asks {
                if let Some(node) = plan.get(&ask.allocation_key) {
                    let allocation = Allocation {
                        allocation_key: ask.allocation_key.clone(),
                        uuid: Uuid::new_v4().to_string(),
                        resource: ask.resource.clone(),
                        node_id: node.clone(),
                        application_id: ask.application_id.clone(),
                        partition_name: DEFAULT_PARTITION.to_string(),
                        queue_name: ask.queue_name.clone(),
                        tags: None,
                    };
                    minted.lock().unwrap().push(allocation.clone());
                    if callback.new_allocation(&allocation).await.is_err() {
                        // A real core resubmits; the recording mock only
                        // notes the loss.
                        tracing::error!(
                            allocation_key = %allocation.allocation_key,
                            "mock core failed to deliver allocation"
                        );
                    }
                }
            }
        });
        Ok(())
    }

    async fn reload_configuration(&self, cluster_id: &str) -> Result<()> {
        self.reloads.lock().unwrap().push(cluster_id.to_string());
        Ok(())
    }
}

// ---- mock orchestrator ---------------------------------------------------

pub struct MockOrchestratorClient {
    binds: Arc<Mutex<Vec<(String, String)>>>,
    deletes: Arc<Mutex<Vec<String>>>,
    bind_failure: Arc<Mutex<Option<MockFailure>>>,
    watch_failure: Arc<Mutex<Option<MockFailure>>>,
    nodes: Arc<Mutex<Vec<ClusterNode>>>,
    pods: Arc<Mutex<Vec<Pod>>>,
    watchers: Arc<Mutex<Vec<(String, mpsc::Sender<WatchEvent>)>>>,
}

impl Default for MockOrchestratorClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOrchestratorClient {
    pub fn new() -> Self {
        Self {
            binds: Arc::new(Mutex::new(Vec::new())),
            deletes: Arc::new(Mutex::new(Vec::new())),
            bind_failure: Arc::new(Mutex::new(None)),
            watch_failure: Arc::new(Mutex::new(None)),
            nodes: Arc::new(Mutex::new(Vec::new())),
            pods: Arc::new(Mutex::new(Vec::new())),
            watchers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Seed the cluster state returned by `list_nodes`/`list_pods`.
    pub fn seed_node(&self, node: ClusterNode) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn seed_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn set_bind_failure(&self, failure: Option<MockFailure>) {
        *self.bind_failure.lock().unwrap() = failure;
    }

    pub fn set_watch_failure(&self, failure: Option<MockFailure>) {
        *self.watch_failure.lock().unwrap() = failure;
    }

    pub fn binds(&self) -> Vec<(String, String)> {
        self.binds.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }

    /// Push an event to every watcher of the namespace.
    pub async fn push_watch_event(&self, namespace: &str, event: WatchEvent) {
        let senders: Vec<mpsc::Sender<WatchEvent>> = self
            .watchers
            .lock()
            .unwrap()
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Drop all watch senders, closing the streams.
    pub fn close_watches(&self) {
        self.watchers.lock().unwrap().clear();
    }
}

#[async_trait]
impl OrchestratorClient for MockOrchestratorClient {
    async fn bind_pod(&self, pod_uid: &str, node_name: &str) -> Result<()> {
        if let Some(failure) = self.bind_failure.lock().unwrap().clone() {
            return Err(failure.into_error());
        }
        self.binds
            .lock()
            .unwrap()
            .push((pod_uid.to_string(), node_name.to_string()));
        Ok(())
    }

    async fn delete_pod(&self, pod_uid: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(pod_uid.to_string());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn watch_pods(&self, namespace: &str) -> Result<PodWatch> {
        if let Some(failure) = self.watch_failure.lock().unwrap().clone() {
            return Err(failure.into_error());
        }
        let (tx, rx) = mpsc::channel(16);
        self.watchers
            .lock()
            .unwrap()
            .push((namespace.to_string(), tx));
        Ok(rx)
    }
}

// ---- mock volume binder --------------------------------------------------

pub struct MockVolumeBinder {
    assume_failure: Arc<Mutex<Option<MockFailure>>>,
    bind_failure: Arc<Mutex<Option<MockFailure>>>,
    all_bound: Arc<AtomicBool>,
    assume_calls: Arc<AtomicUsize>,
    bind_calls: Arc<AtomicUsize>,
}

impl Default for MockVolumeBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVolumeBinder {
    pub fn new() -> Self {
        Self {
            assume_failure: Arc::new(Mutex::new(None)),
            bind_failure: Arc::new(Mutex::new(None)),
            all_bound: Arc::new(AtomicBool::new(false)),
            assume_calls: Arc::new(AtomicUsize::new(0)),
            bind_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_all_bound(&self, all_bound: bool) {
        self.all_bound.store(all_bound, Ordering::SeqCst);
    }

    pub fn set_assume_failure(&self, failure: Option<MockFailure>) {
        *self.assume_failure.lock().unwrap() = failure;
    }

    pub fn set_bind_failure(&self, failure: Option<MockFailure>) {
        *self.bind_failure.lock().unwrap() = failure;
    }

    pub fn assume_calls(&self) -> usize {
        self.assume_calls.load(Ordering::SeqCst)
    }

    pub fn bind_calls(&self) -> usize {
        self.bind_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VolumeBinder for MockVolumeBinder {
    async fn assume_pod_volumes(&self, _pod: &Pod, _node_name: &str) -> Result<bool> {
        self.assume_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.assume_failure.lock().unwrap().clone() {
            return Err(failure.into_error());
        }
        Ok(self.all_bound.load(Ordering::SeqCst))
    }

    async fn bind_pod_volumes(&self, _pod: &Pod) -> Result<()> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.bind_failure.lock().unwrap().clone() {
            return Err(failure.into_error());
        }
        Ok(())
    }
}
