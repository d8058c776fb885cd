//! Inbound scheduler-core callbacks.
//!
//! Scheduler-core pushes decisions asynchronously; this adapter translates
//! each one into a dispatcher event so entity mutation stays serialized on
//! the consumer tasks.
//!
//! Accept/reject notifications are idempotent (the next tick re-submits),
//! so backpressure drops them with a warning. Allocation events are not:
//! nothing re-emits them, and the core believes an allocation exists until
//! the shim reacts. Those are re-queued with a bounded retry, and
//! exhaustion surfaces as an error for the proxy layer to resubmit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cache::Context;
use crate::core::types::{Allocation, AllocationRelease};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::error::{Result, ShimError};
use crate::events::{ApplicationEvent, ApplicationVerb, Event, NodeEvent, NodeVerb, TaskEvent};

const REQUEUE_ATTEMPTS: usize = 20;
const REQUEUE_DELAY: Duration = Duration::from_millis(50);

pub struct RmCallback {
    context: Arc<Context>,
    dispatcher: Arc<Dispatcher>,
}

impl RmCallback {
    pub fn new(context: Arc<Context>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            context,
            dispatcher,
        }
    }

    pub fn application_accepted(&self, application_id: &str) {
        info!(application_id, "application accepted by scheduler-core");
        if let Err(e) = self.dispatcher.dispatch(ApplicationEvent::simple(
            application_id,
            ApplicationVerb::Accept,
        )) {
            warn!(application_id, error = %e, "accept event dropped");
        }
    }

    pub fn application_rejected(&self, application_id: &str, reason: &str) {
        info!(application_id, reason, "application rejected by scheduler-core");
        if let Err(e) = self
            .dispatcher
            .dispatch(ApplicationEvent::reject(application_id, reason))
        {
            warn!(application_id, error = %e, "reject event dropped");
        }
    }

    pub async fn new_allocation(&self, allocation: &Allocation) -> Result<()> {
        info!(
            application_id = %allocation.application_id,
            allocation_key = %allocation.allocation_key,
            node_id = %allocation.node_id,
            uuid = %allocation.uuid,
            "allocation received from scheduler-core"
        );
        let event = TaskEvent::allocated(
            allocation.application_id.clone(),
            allocation.allocation_key.clone(),
            allocation.node_id.clone(),
            allocation.uuid.clone(),
        );
        self.dispatch_requeued(event.into()).await.map_err(|e| {
            error!(
                allocation_key = %allocation.allocation_key,
                error = %e,
                "failed to deliver allocation event, caller must resubmit"
            );
            e
        })
    }

    /// Scheduler-core revoked an allocation (preemption, queue shrink).
    pub async fn release_allocation(&self, release: &AllocationRelease) -> Result<()> {
        let task = self
            .context
            .find_task_by_allocation(&release.application_id, &release.allocation_uuid)
            .await;
        let Some(task) = task else {
            warn!(
                application_id = %release.application_id,
                uuid = %release.allocation_uuid,
                "release for unknown allocation, dropping"
            );
            return Ok(());
        };

        let reason = format!(
            "allocation released by scheduler-core: {:?}",
            release.reason
        );
        let event = TaskEvent::fail(
            release.application_id.clone(),
            task.task_id().to_string(),
            reason,
        );
        self.dispatch_requeued(event.into()).await.map_err(|e| {
            error!(
                application_id = %release.application_id,
                uuid = %release.allocation_uuid,
                error = %e,
                "failed to deliver release event, caller must resubmit"
            );
            e
        })
    }

    pub fn node_accepted(&self, node_id: &str) {
        if let Err(e) = self
            .dispatcher
            .dispatch(NodeEvent::new(node_id, NodeVerb::Accept))
        {
            warn!(node_id, error = %e, "node accept event dropped");
        }
    }

    pub fn node_rejected(&self, node_id: &str, reason: &str) {
        warn!(node_id, reason, "node rejected by scheduler-core");
    }

    /// Re-queue on backpressure instead of dropping. Gives up once the
    /// dispatcher stops or the retry budget runs out.
    async fn dispatch_requeued(&self, event: Event) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            match self.dispatcher.dispatch(event.clone()) {
                Ok(()) => return Ok(()),
                Err(DispatchError::Backpressure { kind }) => {
                    attempt += 1;
                    if attempt >= REQUEUE_ATTEMPTS {
                        return Err(ShimError::transient(format!(
                            "dispatcher {kind} queue still full after {attempt} attempts"
                        )));
                    }
                    warn!(kind, attempt, "dispatcher backpressure, re-queueing allocation event");
                    tokio::time::sleep(REQUEUE_DELAY).await;
                }
                Err(e @ DispatchError::Stopped) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiProvider;
    use crate::common::ResourceBuilder;
    use crate::config::ShimConfig;
    use crate::test_utils::{MockOrchestratorClient, MockSchedulerApi};
    use crate::events::TaskVerb;

    fn callback_fixture(capacity: usize) -> (RmCallback, Arc<Dispatcher>) {
        let config = Arc::new(ShimConfig::for_testing("callback-test"));
        let api = Arc::new(ApiProvider::new(
            Arc::new(MockOrchestratorClient::new()),
            None,
            config.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(capacity, Duration::from_millis(100)));
        let context = Context::new(
            api,
            Arc::new(MockSchedulerApi::new()),
            dispatcher.clone(),
            config,
        );
        (RmCallback::new(context, dispatcher.clone()), dispatcher)
    }

    fn allocation(key: &str) -> Allocation {
        Allocation {
            allocation_key: key.to_string(),
            uuid: format!("uuid-{key}"),
            resource: ResourceBuilder::new().cpu_milli(100).build(),
            node_id: "n1".to_string(),
            application_id: "app-cb".to_string(),
            partition_name: "default".to_string(),
            queue_name: "root.default".to_string(),
            tags: None,
        }
    }

    #[tokio::test]
    async fn allocation_events_enqueue_when_capacity_allows() {
        let (callback, _dispatcher) = callback_fixture(8);
        callback.new_allocation(&allocation("t1")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn allocation_events_surface_exhausted_backpressure() {
        let (callback, dispatcher) = callback_fixture(1);
        // Fill the (unconsumed) task queue so every dispatch backpressures.
        dispatcher
            .dispatch(TaskEvent::simple("app-cb", "t0", TaskVerb::Init))
            .unwrap();

        let err = callback.new_allocation(&allocation("t1")).await.unwrap_err();
        assert!(err.is_retriable());
    }
}
