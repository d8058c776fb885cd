//! Per-workload completion handlers.
//!
//! An application has at most one handler. For Spark workloads the handler
//! watches the driver pod; observing `Succeeded` for the same UID completes
//! the application. The watch stream closing first means no completion was
//! observed and the handler exits silently.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::api::{Pod, PodPhase};
use crate::cache::{Application, Context};
use crate::client::ApiProvider;
use crate::constants::labels;
use crate::events::{ApplicationEvent, ApplicationVerb};

/// Control handle for a running completion watcher.
pub struct CompletionHandle {
    stop_tx: watch::Sender<bool>,
}

impl CompletionHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Whether this pod is a Spark driver, the trigger for the Spark handler.
pub fn is_spark_driver(pod: &Pod) -> bool {
    pod.label(labels::SPARK_ROLE) == Some(labels::SPARK_ROLE_DRIVER)
}

/// Start the Spark completion handler for `app`, watching `pod`.
///
/// The `running` gate is compare-and-set before the watcher task spawns, so
/// concurrent informer callbacks cannot start two watchers. Watches are
/// bounded by the service-wide semaphore to keep a workload storm from
/// overwhelming the orchestrator API.
pub fn start_spark_completion_handler(
    context: Arc<Context>,
    api: Arc<ApiProvider>,
    app: Arc<Application>,
    pod: &Pod,
    watches: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !is_spark_driver(pod) {
        return;
    }
    if !app.try_begin_completion_handler() {
        return;
    }

    let permit = match watches.try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!(
                application_id = %app.application_id(),
                "completion watch limit reached, handler not started"
            );
            app.abort_completion_handler();
            return;
        }
    };

    info!(
        application_id = %app.application_id(),
        pod = %pod.name,
        "starting app completion handler"
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    app.set_completion_handler(CompletionHandle { stop_tx });

    let namespace = pod.namespace.clone();
    let driver_uid = pod.uid.clone();
    let application_id = app.application_id().to_string();

    tokio::spawn(async move {
        let _permit = permit;
        let mut stream = match api.client().watch_pods(&namespace).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    application_id = %application_id,
                    error = %e,
                    "unable to create watch for driver pod"
                );
                // Release the gate and the stored handle so a later
                // delete event can start a fresh handler.
                app.stop_completion_handler();
                return;
            }
        };

        loop {
            tokio::select! {
                event = stream.recv() => match event {
                    Some(event) => {
                        let observed = event.pod();
                        if observed.uid == driver_uid && observed.phase == PodPhase::Succeeded {
                            info!(
                                application_id = %application_id,
                                pod = %observed.name,
                                "driver completed, application completed"
                            );
                            context.dispatch(ApplicationEvent::simple(
                                application_id.clone(),
                                ApplicationVerb::Complete,
                            ));
                            return;
                        }
                    }
                    // Stream closed before success: no completion was
                    // observed, so the gate reopens for a future restart.
                    None => {
                        app.stop_completion_handler();
                        return;
                    }
                },
                _ = stop_rx.changed() => return,
                _ = shutdown.changed() => return,
            }
        }
    });
}
