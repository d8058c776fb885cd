//! Task entity: one schedulable unit of an application, backed by an
//! orchestrator pod. Owns the task state machine and the node/allocation
//! attributes that go with it.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::Pod;
use crate::cache::context::Context;
use crate::cache::FailureRecord;
use crate::core::types::{AllocationRelease, ReleaseReason, UpdateRequest};
use crate::error::{Result, ShimError};
use crate::events::{TaskEvent, TaskVerb};
use crate::state_machine::{StateMachine, StateMachineError, TaskState, Transition};

static TASK_TRANSITIONS: &[Transition<TaskState, TaskVerb>] = &[
    Transition {
        verb: TaskVerb::Init,
        from: &[TaskState::New],
        to: TaskState::Pending,
    },
    Transition {
        verb: TaskVerb::Schedule,
        from: &[TaskState::Pending],
        to: TaskState::Scheduling,
    },
    Transition {
        verb: TaskVerb::Allocated,
        from: &[TaskState::Scheduling],
        to: TaskState::Allocated,
    },
    Transition {
        verb: TaskVerb::Bind,
        from: &[TaskState::Allocated],
        to: TaskState::Bound,
    },
    Transition {
        verb: TaskVerb::Complete,
        from: &[TaskState::Bound, TaskState::Allocated],
        to: TaskState::Completed,
    },
    Transition {
        verb: TaskVerb::Fail,
        from: &[
            TaskState::New,
            TaskState::Pending,
            TaskState::Scheduling,
            TaskState::Allocated,
            TaskState::Bound,
        ],
        to: TaskState::Failed,
    },
    Transition {
        verb: TaskVerb::Reject,
        from: &[TaskState::Pending],
        to: TaskState::Rejected,
    },
];

struct TaskInner {
    sm: StateMachine<TaskState, TaskVerb>,
    pod: Pod,
    node_name: Option<String>,
    allocation_uuid: Option<String>,
    failure: Option<FailureRecord>,
}

pub struct Task {
    application_id: String,
    task_id: String,
    // Weak back-reference: the context owns applications which own tasks.
    context: Weak<Context>,
    inner: RwLock<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("application_id", &self.application_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        application_id: impl Into<String>,
        pod: Pod,
        context: Weak<Context>,
    ) -> Arc<Self> {
        Arc::new(Self {
            application_id: application_id.into(),
            task_id: task_id.into(),
            context,
            inner: RwLock::new(TaskInner {
                sm: StateMachine::new(TaskState::New, TASK_TRANSITIONS),
                pod,
                node_name: None,
                allocation_uuid: None,
                failure: None,
            }),
        })
    }

    /// Recovery lineage: the pod already runs on a node, so the task starts
    /// out Allocated with the pod's uid as its allocation UUID.
    pub fn new_recovered(
        task_id: impl Into<String>,
        application_id: impl Into<String>,
        pod: Pod,
        context: Weak<Context>,
    ) -> Arc<Self> {
        let node_name = pod.node_name.clone();
        let allocation_uuid = Some(pod.uid.clone());
        Arc::new(Self {
            application_id: application_id.into(),
            task_id: task_id.into(),
            context,
            inner: RwLock::new(TaskInner {
                sm: StateMachine::new(TaskState::Allocated, TASK_TRANSITIONS),
                pod,
                node_name,
                allocation_uuid,
                failure: None,
            }),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub async fn state(&self) -> TaskState {
        self.inner.read().await.sm.current()
    }

    pub async fn node_name(&self) -> Option<String> {
        self.inner.read().await.node_name.clone()
    }

    pub async fn allocation_uuid(&self) -> Option<String> {
        self.inner.read().await.allocation_uuid.clone()
    }

    pub async fn pod(&self) -> Pod {
        self.inner.read().await.pod.clone()
    }

    pub async fn failure(&self) -> Option<FailureRecord> {
        self.inner.read().await.failure.clone()
    }

    pub async fn can_handle(&self, verb: TaskVerb) -> bool {
        self.inner.read().await.sm.can(verb)
    }

    /// A task is ready for its first scheduling pass once its pod carries a
    /// non-empty resource request.
    pub async fn is_ready_for_scheduling(&self) -> bool {
        !self.inner.read().await.pod.resources.is_empty()
    }

    /// Run a state transition. The entity lock is held for the duration;
    /// the verb callback runs before the new state commits and must not
    /// touch this task through the context again.
    pub async fn handle(&self, event: &TaskEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        debug!(
            task_id = %self.task_id,
            application_id = %self.application_id,
            state = %inner.sm.current(),
            verb = %event.verb,
            "task state transition"
        );
        if !inner.sm.can(event.verb) {
            return Err(ShimError::InvalidTransition {
                entity: "task",
                id: self.task_id.clone(),
                state: inner.sm.current().to_string(),
                verb: event.verb.to_string(),
            });
        }

        self.on_event(&mut inner, event).await?;

        match inner.sm.fire(event.verb) {
            Ok(_) | Err(StateMachineError::NoTransition) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn on_event(&self, inner: &mut TaskInner, event: &TaskEvent) -> Result<()> {
        match event.verb {
            TaskVerb::Init => self.on_init(inner).await,
            TaskVerb::Allocated => self.on_allocated(inner, event).await,
            TaskVerb::Bind => self.on_bind(inner).await,
            TaskVerb::Complete => self.on_complete(inner).await,
            TaskVerb::Fail => self.on_fail(inner, event).await,
            TaskVerb::Schedule | TaskVerb::Reject => Ok(()),
        }
    }

    fn context(&self) -> Result<Arc<Context>> {
        self.context
            .upgrade()
            .ok_or_else(|| ShimError::invariant("scheduling context has been dropped"))
    }

    /// Announce the task's resource ask to scheduler-core. A transient RPC
    /// failure aborts the transition so the next tick re-inits; a permanent
    /// one fails the task.
    async fn on_init(&self, inner: &mut TaskInner) -> Result<()> {
        let ctx = self.context()?;
        let config = ctx.config();
        let mut request = UpdateRequest::for_rm(config.cluster_id.clone());
        request.asks.push(ctx.ask_for_pod(&self.application_id, &inner.pod));

        match ctx.scheduler().update(request).await {
            Ok(()) => {
                // Follow-up runs on the dispatcher consumer, never inline.
                ctx.dispatch(TaskEvent::simple(
                    self.application_id.clone(),
                    self.task_id.clone(),
                    TaskVerb::Schedule,
                ));
                Ok(())
            }
            Err(e) if e.is_retriable() => {
                warn!(task_id = %self.task_id, error = %e, "transient failure submitting ask");
                Err(e)
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "failed to submit ask");
                ctx.dispatch(TaskEvent::fail(
                    self.application_id.clone(),
                    self.task_id.clone(),
                    format!("ask submission failed: {e}"),
                ));
                Err(e)
            }
        }
    }

    /// Record the placement decision, then assume the pod onto its node.
    /// The assumption failing does not abort the transition: the allocation
    /// UUID is already live in scheduler-core and must survive until the
    /// follow-up Fail releases it.
    async fn on_allocated(&self, inner: &mut TaskInner, event: &TaskEvent) -> Result<()> {
        let node_id = event
            .node_id
            .as_deref()
            .ok_or_else(|| ShimError::invariant("allocation event without node id"))?;
        let uuid = event
            .allocation_uuid
            .as_deref()
            .ok_or_else(|| ShimError::invariant("allocation event without uuid"))?;

        inner.node_name = Some(node_id.to_string());
        inner.allocation_uuid = Some(uuid.to_string());

        let ctx = self.context()?;
        match ctx.assume_pod(&self.task_id, node_id).await {
            Ok(()) => {
                ctx.dispatch(TaskEvent::simple(
                    self.application_id.clone(),
                    self.task_id.clone(),
                    TaskVerb::Bind,
                ));
                Ok(())
            }
            Err(e) => {
                warn!(task_id = %self.task_id, node_id, error = %e, "assume failed");
                ctx.dispatch(TaskEvent::fail(
                    self.application_id.clone(),
                    self.task_id.clone(),
                    format!("failed to assume pod on node {node_id}: {e}"),
                ));
                Ok(())
            }
        }
    }

    /// Bind volumes that are still unbound, then bind the pod through the
    /// orchestrator. Transient errors re-dispatch Bind; anything else fails
    /// the task, which forgets the assumption and releases the allocation.
    async fn on_bind(&self, inner: &mut TaskInner) -> Result<()> {
        let ctx = self.context()?;
        let node_name = inner
            .node_name
            .clone()
            .ok_or_else(|| ShimError::invariant("bind without an assigned node"))?;

        let result = async {
            if !ctx.cache().are_pod_volumes_all_bound(&self.task_id) {
                ctx.bind_pod_volumes(&self.task_id).await?;
            }
            ctx.api_provider()
                .client()
                .bind_pod(&self.task_id, &node_name)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(
                    task_id = %self.task_id,
                    application_id = %self.application_id,
                    node = %node_name,
                    "task bound"
                );
                Ok(())
            }
            Err(e) if e.is_retriable() => {
                warn!(task_id = %self.task_id, error = %e, "transient bind failure, retrying");
                ctx.dispatch(TaskEvent::simple(
                    self.application_id.clone(),
                    self.task_id.clone(),
                    TaskVerb::Bind,
                ));
                Err(e)
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "bind failed");
                ctx.dispatch(TaskEvent::fail(
                    self.application_id.clone(),
                    self.task_id.clone(),
                    format!("bind failed: {e}"),
                ));
                Err(e)
            }
        }
    }

    async fn on_complete(&self, inner: &mut TaskInner) -> Result<()> {
        if let Some(uuid) = inner.allocation_uuid.clone() {
            let ctx = self.context()?;
            if let Err(e) = self
                .release_allocation(&ctx, &uuid, ReleaseReason::Completed, None)
                .await
            {
                warn!(task_id = %self.task_id, error = %e, "failed to release completed allocation");
            }
        }
        Ok(())
    }

    async fn on_fail(&self, inner: &mut TaskInner, event: &TaskEvent) -> Result<()> {
        let previous = inner.sm.current();
        inner.failure = Some(FailureRecord {
            reason: event
                .reason
                .clone()
                .unwrap_or_else(|| "task failed".to_string()),
            failed_at: Utc::now(),
        });

        let ctx = self.context()?;
        ctx.cache().forget_pod(&self.task_id);

        if let Some(uuid) = inner.allocation_uuid.take() {
            if let Err(e) = self
                .release_allocation(
                    &ctx,
                    &uuid,
                    ReleaseReason::Stopped,
                    inner.failure.as_ref().map(|f| f.reason.clone()),
                )
                .await
            {
                warn!(task_id = %self.task_id, error = %e, "failed to release allocation on task failure");
            }
        }

        // A task that failed after binding keeps its node name for
        // diagnosis; one that never bound loses it.
        if previous != TaskState::Bound {
            inner.node_name = None;
        }
        Ok(())
    }

    async fn release_allocation(
        &self,
        ctx: &Arc<Context>,
        uuid: &str,
        reason: ReleaseReason,
        message: Option<String>,
    ) -> Result<()> {
        let config = ctx.config();
        let mut request = UpdateRequest::for_rm(config.cluster_id.clone());
        request.releases.push(AllocationRelease {
            application_id: self.application_id.clone(),
            allocation_uuid: uuid.to_string(),
            partition_name: crate::constants::DEFAULT_PARTITION.to_string(),
            reason,
            message,
        });
        ctx.scheduler().update(request).await
    }
}
