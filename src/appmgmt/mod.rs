//! # Application Management
//!
//! Watches workload pods and turns them into applications and tasks. Pods
//! are recognized by scheduler name plus application-id label; pod deletion
//! completes the matching task and, for recognized workloads, starts a
//! completion handler that decides when the whole application is done.

pub mod completion;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::api::{Pod, PodPhase};
use crate::cache::{Application, ApplicationMetadata, Context};
use crate::client::ApiProvider;
use crate::common::utils::{get_application_id, get_queue_name, is_schedulable_pod};
use crate::config::ShimConfig;
use crate::constants::DEFAULT_NAMESPACE;
use crate::error::Result;
use crate::events::{TaskEvent, TaskVerb};

pub struct AppManagementService {
    context: Arc<Context>,
    api: Arc<ApiProvider>,
    config: Arc<ShimConfig>,
    /// Bounds concurrently running completion watches.
    watches: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl AppManagementService {
    pub fn new(context: Arc<Context>, api: Arc<ApiProvider>) -> Arc<Self> {
        let config = api.config().clone();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            context,
            api,
            watches: Arc::new(Semaphore::new(config.max_completion_watches)),
            config,
            shutdown_tx,
        })
    }

    /// Informer filter: pods without our scheduler name or an application
    /// id are ignored silently.
    pub fn filter_pod(&self, pod: &Pod) -> bool {
        is_schedulable_pod(pod, &self.config)
    }

    /// A pod entering the cluster becomes an application/task pair, but
    /// only while it is still pending; running pods are recovery material.
    pub async fn add_pod(&self, pod: &Pod) {
        debug!(
            namespace = %pod.namespace,
            pod = %pod.name,
            uid = %pod.uid,
            phase = ?pod.phase,
            "add pod"
        );
        if pod.phase != PodPhase::Pending {
            return;
        }
        if let Err(e) = self.add_application_internal(pod, false) {
            warn!(pod = %pod.name, error = %e, "unable to add application for pod");
        }
    }

    // TODO: vertical pod scaling needs the updated resource ask reported to
    // scheduler-core; requires ask replacement support on the core side.
    pub async fn update_pod(&self, _old: &Pod, _new: &Pod) {
        debug!("pod updated");
    }

    /// Pod deletion completes the task. When the deleted pod is a workload
    /// pivot (a Spark driver), a completion handler takes over deciding the
    /// application's fate.
    pub async fn delete_pod(&self, pod: &Pod) {
        let application_id = match get_application_id(pod, &self.config) {
            Ok(id) => id,
            Err(e) => {
                warn!(pod = %pod.name, error = %e, "unable to get application for deleted pod");
                return;
            }
        };

        let Some(app) = self.context.get_application(&application_id) else {
            debug!(application_id, "deleted pod for unknown application");
            return;
        };

        info!(
            namespace = %pod.namespace,
            pod = %pod.name,
            uid = %pod.uid,
            "delete pod"
        );
        self.context.dispatch(TaskEvent::simple(
            app.application_id(),
            pod.uid.clone(),
            TaskVerb::Complete,
        ));

        self.start_completion_handler(app, pod);
    }

    /// Recover the application/task lineage for a pod found running at
    /// startup.
    pub fn recover_application(&self, pod: &Pod) -> Result<Arc<Application>> {
        self.add_application_internal(pod, true)
    }

    fn add_application_internal(&self, pod: &Pod, recovery: bool) -> Result<Arc<Application>> {
        let application_id = get_application_id(pod, &self.config)?;

        let app = match self.context.get_application(&application_id) {
            Some(app) => app,
            None => {
                // Tags carry at least the namespace; the user identity is
                // the pod's service account, all that is available here.
                let mut tags = HashMap::new();
                tags.insert(
                    "namespace".to_string(),
                    if pod.namespace.is_empty() {
                        DEFAULT_NAMESPACE.to_string()
                    } else {
                        pod.namespace.clone()
                    },
                );
                self.context.add_application(
                    ApplicationMetadata {
                        application_id: application_id.clone(),
                        queue: get_queue_name(pod),
                        user: pod.service_account.clone(),
                        tags,
                    },
                    recovery,
                )
            }
        };

        if app.get_task(&pod.uid).is_err() {
            self.context
                .add_task(&application_id, &pod.uid, pod.clone(), recovery)?;
        }
        Ok(app)
    }

    pub fn start_completion_handler(&self, app: Arc<Application>, pod: &Pod) {
        completion::start_spark_completion_handler(
            self.context.clone(),
            self.api.clone(),
            app,
            pod,
            self.watches.clone(),
            self.shutdown_tx.subscribe(),
        );
    }

    /// Terminate all running completion watches.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
