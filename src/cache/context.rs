//! The scheduling context: authoritative map of applications to tasks, the
//! node registry, and the assume/bind bookkeeping against the orchestrator
//! cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::api::{ClusterNode, ConfigMap, Pod};
use crate::cache::application::Application;
use crate::cache::external::SchedulerCache;
use crate::cache::nodes::SchedulerNodes;
use crate::cache::task::Task;
use crate::client::ApiProvider;
use crate::common::utils::{get_queue_name, is_schedulable_pod};
use crate::config::ShimConfig;
use crate::constants::{DEFAULT_CONFIG_MAP_NAME, DEFAULT_PARTITION};
use crate::core::types::AllocationAsk;
use crate::core::SchedulerApi;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::error::{Result, ShimError};
use crate::events::{
    ApplicationEvent, ApplicationVerb, Event, NodeEvent, TaskEvent,
};
use crate::predicates::{PredicateMeta, Predictor, ResourceFitEvaluator};

/// Identity and placement attributes of a new application.
#[derive(Debug, Clone)]
pub struct ApplicationMetadata {
    pub application_id: String,
    pub queue: String,
    pub user: String,
    pub tags: HashMap<String, String>,
}

pub struct Context {
    applications: StdRwLock<HashMap<String, Arc<Application>>>,
    nodes: SchedulerNodes,
    cache: Arc<SchedulerCache>,
    api_provider: Arc<ApiProvider>,
    scheduler: Arc<dyn SchedulerApi>,
    dispatcher: Arc<Dispatcher>,
    predictor: Predictor,
    config: Arc<ShimConfig>,
}

impl Context {
    /// Wire up a context. In testing mode predicate evaluation is disabled,
    /// mirroring how the production wiring swaps in the real evaluator.
    pub fn new(
        api_provider: Arc<ApiProvider>,
        scheduler: Arc<dyn SchedulerApi>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<ShimConfig>,
    ) -> Arc<Self> {
        let predictor = if config.testing_mode {
            Predictor::disabled()
        } else {
            Predictor::new(Arc::new(ResourceFitEvaluator))
        };
        Self::with_predictor(api_provider, scheduler, dispatcher, config, predictor)
    }

    pub fn with_predictor(
        api_provider: Arc<ApiProvider>,
        scheduler: Arc<dyn SchedulerApi>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<ShimConfig>,
        predictor: Predictor,
    ) -> Arc<Self> {
        let cache = Arc::new(SchedulerCache::new());
        let nodes = SchedulerNodes::new(
            cache.clone(),
            scheduler.clone(),
            dispatcher.clone(),
            config.clone(),
        );
        Arc::new(Self {
            applications: StdRwLock::new(HashMap::new()),
            nodes,
            cache,
            api_provider,
            scheduler,
            dispatcher,
            predictor,
            config,
        })
    }

    pub fn config(&self) -> &Arc<ShimConfig> {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn SchedulerApi> {
        &self.scheduler
    }

    pub fn api_provider(&self) -> &Arc<ApiProvider> {
        &self.api_provider
    }

    pub fn cache(&self) -> &Arc<SchedulerCache> {
        &self.cache
    }

    pub fn nodes(&self) -> &SchedulerNodes {
        &self.nodes
    }

    /// Dispatch with drop-and-log semantics: callers of this helper emit
    /// idempotent transition triggers that the next tick will re-emit.
    pub fn dispatch(&self, event: impl Into<Event>) {
        let event = event.into();
        let kind = event.kind();
        if let Err(e) = self.dispatcher.dispatch(event) {
            warn!(kind, error = %e, "event dropped");
        }
    }

    // ---- application registry ------------------------------------------

    /// Register an application. Adding a known id returns the existing
    /// entry, which keeps recovery idempotent.
    pub fn add_application(
        self: &Arc<Self>,
        metadata: ApplicationMetadata,
        recovery: bool,
    ) -> Arc<Application> {
        let app = {
            let mut apps = self.applications.write().unwrap();
            if let Some(existing) = apps.get(&metadata.application_id) {
                return existing.clone();
            }
            let app = Application::new(
                metadata.application_id.clone(),
                metadata.queue,
                metadata.user,
                metadata.tags,
                Arc::downgrade(self),
            );
            apps.insert(metadata.application_id.clone(), app.clone());
            app
        };

        if recovery {
            self.dispatch(ApplicationEvent::simple(
                app.application_id(),
                ApplicationVerb::Recover,
            ));
        }

        info!(
            application_id = %app.application_id(),
            recovery,
            "application added"
        );
        app
    }

    /// Registry upsert, used when an application object is rebuilt.
    pub fn update_application(&self, app: Arc<Application>) {
        let mut apps = self.applications.write().unwrap();
        apps.insert(app.application_id().to_string(), app);
    }

    pub fn remove_application(&self, application_id: &str) -> Result<()> {
        let mut apps = self.applications.write().unwrap();
        apps.remove(application_id).map(|_| ()).ok_or_else(|| {
            ShimError::invariant(format!("application {application_id} is not found in context"))
        })
    }

    pub fn get_application(&self, application_id: &str) -> Option<Arc<Application>> {
        self.applications
            .read()
            .unwrap()
            .get(application_id)
            .cloned()
    }

    pub fn select_applications<F>(&self, filter: F) -> Vec<Arc<Application>>
    where
        F: Fn(&Application) -> bool,
    {
        self.applications
            .read()
            .unwrap()
            .values()
            .filter(|app| filter(app))
            .cloned()
            .collect()
    }

    pub fn all_applications(&self) -> Vec<Arc<Application>> {
        self.select_applications(|_| true)
    }

    /// Register a task under its application. In recovery mode the task is
    /// considered allocated on the pod's node.
    pub fn add_task(
        self: &Arc<Self>,
        application_id: &str,
        task_id: &str,
        pod: Pod,
        recovery: bool,
    ) -> Result<Arc<Task>> {
        let app = self.get_application(application_id).ok_or_else(|| {
            ShimError::invariant(format!("application {application_id} is not found in context"))
        })?;

        if let Ok(existing) = app.get_task(task_id) {
            return Ok(existing);
        }

        let task = if recovery {
            Task::new_recovered(task_id, application_id, pod, Arc::downgrade(self))
        } else {
            Task::new(task_id, application_id, pod, Arc::downgrade(self))
        };
        app.add_task(task.clone());
        info!(application_id, task_id, recovery, "task added");
        Ok(task)
    }

    pub fn get_task(&self, application_id: &str, task_id: &str) -> Result<Arc<Task>> {
        let app = self.get_application(application_id).ok_or_else(|| {
            ShimError::invariant(format!("application {application_id} is not found in context"))
        })?;
        app.get_task(task_id)
    }

    pub async fn find_task_by_allocation(
        &self,
        application_id: &str,
        allocation_uuid: &str,
    ) -> Option<Arc<Task>> {
        let app = self.get_application(application_id)?;
        for task in app.tasks() {
            if task.allocation_uuid().await.as_deref() == Some(allocation_uuid) {
                return Some(task);
            }
        }
        None
    }

    /// Tell the application it is done; completion further releases its
    /// allocations through the task machinery.
    pub fn notify_application_complete(&self, application_id: &str) {
        if self.get_application(application_id).is_some() {
            self.dispatch(ApplicationEvent::simple(
                application_id,
                ApplicationVerb::Complete,
            ));
        }
    }

    // ---- assume/bind protocol ------------------------------------------

    /// Provisionally reserve the pod onto the node: deep-copy the cached
    /// pod, pre-bind volumes, stamp the node name, and record the copy with
    /// its `all_bound` flag. A volume failure returns before any cache
    /// mutation.
    pub async fn assume_pod(&self, pod_uid: &str, node_name: &str) -> Result<()> {
        let pod = self.cache.get_pod(pod_uid).ok_or_else(|| {
            ShimError::invariant(format!("pod {pod_uid} not found in scheduler cache"))
        })?;
        self.cache.get_node(node_name).ok_or_else(|| {
            ShimError::invariant(format!("node {node_name} not found in scheduler cache"))
        })?;

        // The volume binder is optional; with none present all volumes
        // count as bound.
        let mut all_bound = true;
        if let Some(binder) = self.api_provider.volume_binder() {
            all_bound = binder.assume_pod_volumes(&pod, node_name).await?;
        }

        let mut assumed = pod.clone();
        assumed.node_name = Some(node_name.to_string());
        self.cache.assume_pod(assumed, all_bound);
        Ok(())
    }

    /// Drop an assumption, used when binding fails or the allocation is
    /// released. Idempotent.
    pub fn forget_pod(&self, pod_uid: &str) {
        debug!(pod_uid, "forget pod");
        self.cache.forget_pod(pod_uid);
    }

    /// Bind volumes that assume-time pre-binding left unbound.
    pub async fn bind_pod_volumes(&self, pod_uid: &str) -> Result<()> {
        let Some(pod) = self.cache.get_pod(pod_uid) else {
            return Ok(());
        };
        if self.cache.are_pod_volumes_all_bound(pod_uid) {
            info!(pod_uid, "binding pod volumes skipped: all volumes already bound");
            return Ok(());
        }
        if let Some(binder) = self.api_provider.volume_binder() {
            info!(pod_uid, "binding pod volumes");
            return binder.bind_pod_volumes(&pod).await;
        }
        Ok(())
    }

    /// Evaluate predicates for a (pod, node) pair; returns the first
    /// failing predicate. A disabled evaluator accepts everything.
    pub fn is_pod_fit_node(&self, pod_uid: &str, node_name: &str) -> Result<()> {
        if !self.predictor.enabled() {
            return Ok(());
        }
        let pod = self.cache.get_pod(pod_uid).ok_or_else(|| {
            ShimError::invariant(format!(
                "predicates were not run: pod {pod_uid} not found in cache"
            ))
        })?;
        let node = self.cache.get_node(node_name).ok_or_else(|| {
            ShimError::invariant(format!(
                "predicates were not run: node {node_name} not found in cache"
            ))
        })?;
        let meta = PredicateMeta::new(self.cache.nodes_snapshot());
        self.predictor
            .predicates(&pod, &meta, &node)
            .map_err(|f| ShimError::permanent(f.to_string()))
    }

    /// The resource ask announced to scheduler-core for a pod.
    pub fn ask_for_pod(&self, application_id: &str, pod: &Pod) -> AllocationAsk {
        AllocationAsk {
            application_id: application_id.to_string(),
            allocation_key: pod.uid.clone(),
            resource: pod.resources.clone(),
            queue_name: get_queue_name(pod),
            partition_name: DEFAULT_PARTITION.to_string(),
            max_allocations: 1,
        }
    }

    // ---- informer callbacks --------------------------------------------

    pub async fn add_node(&self, node: &ClusterNode) {
        info!(node = %node.name, "adding node to cache");
        self.cache.add_node(node);
        self.nodes.add_node(node).await;
    }

    pub async fn update_node(&self, old: &ClusterNode, new: &ClusterNode) {
        debug!(node = %new.name, "updating node in cache");
        self.cache.update_node(new);
        self.nodes.update_node(old, new).await;
    }

    pub async fn delete_node(&self, node_name: &str) {
        debug!(node = node_name, "deleting node from cache");
        self.nodes.delete_node(node_name).await;
    }

    /// Only pods that name this shim as their scheduler and carry an
    /// application id are interesting.
    pub fn filter_pods(&self, pod: &Pod) -> bool {
        is_schedulable_pod(pod, &self.config)
    }

    pub fn add_pod_to_cache(&self, pod: &Pod) {
        info!(pod = %pod.name, uid = %pod.uid, "adding pod to cache");
        self.cache.add_pod(pod);
    }

    pub fn update_pod_in_cache(&self, pod: &Pod) {
        self.cache.update_pod(pod);
    }

    pub fn remove_pod_from_cache(&self, pod: &Pod) {
        info!(pod = %pod.name, uid = %pod.uid, "removing pod from cache");
        self.cache.remove_pod(&pod.uid);
    }

    // ---- configuration hot-reload --------------------------------------

    pub fn filter_config_maps(&self, config_map: &ConfigMap) -> bool {
        config_map.name == DEFAULT_CONFIG_MAP_NAME
    }

    pub async fn add_config_map(&self, _config_map: &ConfigMap) {
        debug!("config map added");
        self.trigger_reload_config().await;
    }

    pub async fn update_config_map(&self, _config_map: &ConfigMap) {
        debug!("config map updated, triggering configuration reload");
        self.trigger_reload_config().await;
    }

    /// Deletes are precursors to re-adds; the re-add triggers the reload.
    pub fn delete_config_map(&self, _config_map: &ConfigMap) {
        debug!("config map deleted");
    }

    async fn trigger_reload_config(&self) {
        info!("triggering scheduler configuration reload");
        if let Err(e) = self
            .scheduler
            .reload_configuration(&self.config.cluster_id)
            .await
        {
            error!(error = %e, "configuration reload failed");
        }
    }
}

// ---- dispatcher handlers -------------------------------------------------

#[async_trait]
impl EventHandler<ApplicationEvent> for Context {
    async fn handle_event(&self, event: ApplicationEvent) {
        let Some(app) = self.get_application(&event.application_id) else {
            error!(
                application_id = %event.application_id,
                verb = %event.verb,
                "failed to handle application event: application does not exist"
            );
            return;
        };
        if app.can_handle(event.verb).await {
            if let Err(e) = app.handle(&event).await {
                error!(
                    application_id = %event.application_id,
                    verb = %event.verb,
                    error = %e,
                    "failed to handle application event"
                );
            }
        } else {
            let state = app.state().await;
            warn!(
                application_id = %event.application_id,
                verb = %event.verb,
                state = %state,
                "application event not applicable in current state, dropped"
            );
        }
    }
}

#[async_trait]
impl EventHandler<TaskEvent> for Context {
    async fn handle_event(&self, event: TaskEvent) {
        let task = match self.get_task(&event.application_id, &event.task_id) {
            Ok(task) => task,
            Err(e) => {
                error!(
                    application_id = %event.application_id,
                    task_id = %event.task_id,
                    error = %e,
                    "failed to handle task event"
                );
                return;
            }
        };
        if task.can_handle(event.verb).await {
            if let Err(e) = task.handle(&event).await {
                error!(
                    application_id = %event.application_id,
                    task_id = %event.task_id,
                    verb = %event.verb,
                    error = %e,
                    "failed to handle task event"
                );
            }
        } else {
            let state = task.state().await;
            warn!(
                task_id = %event.task_id,
                verb = %event.verb,
                state = %state,
                "task event not applicable in current state, dropped"
            );
        }
    }
}

#[async_trait]
impl EventHandler<NodeEvent> for Context {
    async fn handle_event(&self, event: NodeEvent) {
        self.nodes.handle_node_event(event).await;
    }
}
