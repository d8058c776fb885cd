//! Application entity: a batch workload grouping of tasks sharing a queue,
//! user, and lifecycle. Owns its task map and at most one completion
//! handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock, Weak};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::appmgmt::completion::CompletionHandle;
use crate::cache::context::Context;
use crate::cache::task::Task;
use crate::cache::FailureRecord;
use crate::constants::DEFAULT_PARTITION;
use crate::core::types::{
    AddApplicationRequest, AllocationRelease, ReleaseReason, UpdateRequest,
};
use crate::error::{Result, ShimError};
use crate::events::{ApplicationEvent, ApplicationVerb, TaskEvent, TaskVerb};
use crate::state_machine::{ApplicationState, StateMachine, StateMachineError, TaskState, Transition};

static APPLICATION_TRANSITIONS: &[Transition<ApplicationState, ApplicationVerb>] = &[
    Transition {
        verb: ApplicationVerb::Submit,
        from: &[ApplicationState::New],
        to: ApplicationState::Submitted,
    },
    Transition {
        verb: ApplicationVerb::Recover,
        from: &[ApplicationState::New],
        to: ApplicationState::Recovering,
    },
    Transition {
        verb: ApplicationVerb::Accept,
        from: &[ApplicationState::Submitted, ApplicationState::Recovering],
        to: ApplicationState::Accepted,
    },
    Transition {
        verb: ApplicationVerb::Run,
        from: &[ApplicationState::Accepted, ApplicationState::Running],
        to: ApplicationState::Running,
    },
    Transition {
        verb: ApplicationVerb::Complete,
        from: &[ApplicationState::Running],
        to: ApplicationState::Completed,
    },
    Transition {
        verb: ApplicationVerb::Reject,
        from: &[ApplicationState::Submitted],
        to: ApplicationState::Rejected,
    },
    Transition {
        verb: ApplicationVerb::Fail,
        from: &[
            ApplicationState::Submitted,
            ApplicationState::Rejected,
            ApplicationState::Accepted,
            ApplicationState::Running,
        ],
        to: ApplicationState::Failed,
    },
    Transition {
        verb: ApplicationVerb::Kill,
        from: &[ApplicationState::Accepted, ApplicationState::Running],
        to: ApplicationState::Killing,
    },
    Transition {
        verb: ApplicationVerb::Killed,
        from: &[ApplicationState::Killing],
        to: ApplicationState::Killed,
    },
];

struct ApplicationInner {
    sm: StateMachine<ApplicationState, ApplicationVerb>,
    failure: Option<FailureRecord>,
}

pub struct Application {
    application_id: String,
    queue: String,
    partition: String,
    user: String,
    tags: HashMap<String, String>,
    task_map: StdRwLock<HashMap<String, Arc<Task>>>,
    inner: RwLock<ApplicationInner>,
    context: Weak<Context>,
    completion_running: AtomicBool,
    completion: Mutex<Option<CompletionHandle>>,
}

impl Application {
    pub fn new(
        application_id: impl Into<String>,
        queue: impl Into<String>,
        user: impl Into<String>,
        tags: HashMap<String, String>,
        context: Weak<Context>,
    ) -> Arc<Self> {
        Arc::new(Self {
            application_id: application_id.into(),
            queue: queue.into(),
            partition: DEFAULT_PARTITION.to_string(),
            user: user.into(),
            tags,
            task_map: StdRwLock::new(HashMap::new()),
            inner: RwLock::new(ApplicationInner {
                sm: StateMachine::new(ApplicationState::New, APPLICATION_TRANSITIONS),
                failure: None,
            }),
            context,
            completion_running: AtomicBool::new(false),
            completion: Mutex::new(None),
        })
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    pub async fn state(&self) -> ApplicationState {
        self.inner.read().await.sm.current()
    }

    pub async fn failure(&self) -> Option<FailureRecord> {
        self.inner.read().await.failure.clone()
    }

    pub fn get_task(&self, task_id: &str) -> Result<Arc<Task>> {
        self.task_map
            .read()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| {
                ShimError::invariant(format!(
                    "task {task_id} does not exist in application {}",
                    self.application_id
                ))
            })
    }

    /// Register a task; adding a duplicate id is a silent no-op.
    pub fn add_task(&self, task: Arc<Task>) {
        let mut tasks = self.task_map.write().unwrap();
        if tasks.contains_key(task.task_id()) {
            debug!(
                application_id = %self.application_id,
                task_id = %task.task_id(),
                "skipping duplicate task"
            );
            return;
        }
        tasks.insert(task.task_id().to_string(), task);
    }

    pub fn task_count(&self) -> usize {
        self.task_map.read().unwrap().len()
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.task_map.read().unwrap().values().cloned().collect()
    }

    pub async fn tasks_in_state(&self, state: TaskState) -> Vec<Arc<Task>> {
        let mut out = Vec::new();
        for task in self.tasks() {
            if task.state().await == state {
                out.push(task);
            }
        }
        out
    }

    pub async fn can_handle(&self, verb: ApplicationVerb) -> bool {
        self.inner.read().await.sm.can(verb)
    }

    /// Run a state transition; the verb callback executes before the new
    /// state commits, with the entity lock held.
    pub async fn handle(&self, event: &ApplicationEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        debug!(
            application_id = %self.application_id,
            state = %inner.sm.current(),
            verb = %event.verb,
            "application state transition"
        );
        if !inner.sm.can(event.verb) {
            return Err(ShimError::InvalidTransition {
                entity: "application",
                id: self.application_id.clone(),
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

    /// Per-tick scheduling pass, run in sync mode (no dispatcher) so a slow
    /// queue cannot pile up duplicate transition events.
    pub async fn schedule(&self) {
        match self.state().await {
            ApplicationState::New => {
                let ev = ApplicationEvent::simple(self.application_id.clone(), ApplicationVerb::Submit);
                if let Err(e) = self.handle(&ev).await {
                    warn!(application_id = %self.application_id, error = %e, "failed to submit application");
                }
            }
            ApplicationState::Accepted => {
                let ev = ApplicationEvent::simple(self.application_id.clone(), ApplicationVerb::Run);
                if let Err(e) = self.handle(&ev).await {
                    warn!(application_id = %self.application_id, error = %e, "failed to run application");
                }
            }
            ApplicationState::Running => {
                for task in self.tasks_in_state(TaskState::New).await {
                    if task.is_ready_for_scheduling().await {
                        let ev = TaskEvent::simple(
                            self.application_id.clone(),
                            task.task_id().to_string(),
                            TaskVerb::Init,
                        );
                        if let Err(e) = task.handle(&ev).await {
                            warn!(
                                application_id = %self.application_id,
                                task_id = %task.task_id(),
                                error = %e,
                                "init task failed"
                            );
                        }
                    } else {
                        debug!(
                            application_id = %self.application_id,
                            task_id = %task.task_id(),
                            "task is not ready for scheduling"
                        );
                    }
                }
                // Tasks whose Schedule event was dropped under backpressure
                // are picked up here on the next pass.
                for task in self.tasks_in_state(TaskState::Pending).await {
                    if task.can_handle(TaskVerb::Schedule).await {
                        let ev = TaskEvent::simple(
                            self.application_id.clone(),
                            task.task_id().to_string(),
                            TaskVerb::Schedule,
                        );
                        if let Err(e) = task.handle(&ev).await {
                            debug!(
                                application_id = %self.application_id,
                                task_id = %task.task_id(),
                                error = %e,
                                "schedule task skipped"
                            );
                        }
                    }
                }
            }
            state => {
                debug!(
                    application_id = %self.application_id,
                    state = %state,
                    "skipping scheduling pass"
                );
            }
        }
    }

    async fn on_event(&self, inner: &mut ApplicationInner, event: &ApplicationEvent) -> Result<()> {
        match event.verb {
            ApplicationVerb::Submit | ApplicationVerb::Recover => self.on_submit(event.verb).await,
            ApplicationVerb::Reject => self.on_reject(inner, event),
            ApplicationVerb::Fail => self.on_fail(inner, event).await,
            ApplicationVerb::Kill => self.on_kill().await,
            ApplicationVerb::Complete => {
                self.stop_completion_handler();
                Ok(())
            }
            ApplicationVerb::Accept | ApplicationVerb::Run | ApplicationVerb::Killed => Ok(()),
        }
    }

    fn context(&self) -> Result<Arc<Context>> {
        self.context
            .upgrade()
            .ok_or_else(|| ShimError::invariant("scheduling context has been dropped"))
    }

    /// Submit and Recover share the same announcement to scheduler-core.
    /// Transient RPC failures abort the transition so the next tick
    /// re-submits; permanent ones fail the application.
    async fn on_submit(&self, verb: ApplicationVerb) -> Result<()> {
        let ctx = self.context()?;
        let config = ctx.config();
        info!(
            application_id = %self.application_id,
            queue = %self.queue,
            cluster_id = %config.cluster_id,
            verb = %verb,
            "submitting application to scheduler-core"
        );

        let mut request = UpdateRequest::for_rm(config.cluster_id.clone());
        request.new_applications.push(AddApplicationRequest {
            application_id: self.application_id.clone(),
            queue_name: self.queue.clone(),
            partition_name: self.partition.clone(),
            user: self.user.clone(),
            tags: self.tags.clone(),
        });

        match ctx.scheduler().update(request).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retriable() => {
                warn!(application_id = %self.application_id, error = %e, "transient submission failure");
                Err(e)
            }
            Err(e) => {
                warn!(application_id = %self.application_id, error = %e, "failed to submit application");
                ctx.dispatch(ApplicationEvent::fail(
                    self.application_id.clone(),
                    format!("submission failed: {e}"),
                ));
                Err(e)
            }
        }
    }

    /// Rejected applications move straight on to Failed.
    fn on_reject(&self, inner: &mut ApplicationInner, event: &ApplicationEvent) -> Result<()> {
        info!(application_id = %self.application_id, "application rejected by scheduler-core");
        inner.failure = Some(FailureRecord {
            reason: event
                .reason
                .clone()
                .unwrap_or_else(|| "rejected by scheduler-core".to_string()),
            failed_at: Utc::now(),
        });
        let ctx = self.context()?;
        ctx.dispatch(ApplicationEvent::fail(
            self.application_id.clone(),
            inner.failure.as_ref().map(|f| f.reason.clone()).unwrap_or_default(),
        ));
        Ok(())
    }

    async fn on_fail(&self, inner: &mut ApplicationInner, event: &ApplicationEvent) -> Result<()> {
        if inner.failure.is_none() {
            inner.failure = Some(FailureRecord {
                reason: event
                    .reason
                    .clone()
                    .unwrap_or_else(|| "application failed".to_string()),
                failed_at: Utc::now(),
            });
        }
        self.release_all_allocations(ReleaseReason::Stopped).await;
        Ok(())
    }

    async fn on_kill(&self) -> Result<()> {
        info!(application_id = %self.application_id, "forwarding kill to scheduler-core");
        self.release_all_allocations(ReleaseReason::Killed).await;
        Ok(())
    }

    async fn release_all_allocations(&self, reason: ReleaseReason) {
        let ctx = match self.context() {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        let mut releases = Vec::new();
        for task in self.tasks() {
            if let Some(uuid) = task.allocation_uuid().await {
                releases.push(AllocationRelease {
                    application_id: self.application_id.clone(),
                    allocation_uuid: uuid,
                    partition_name: self.partition.clone(),
                    reason,
                    message: None,
                });
            }
        }
        if releases.is_empty() {
            return;
        }

        let config = ctx.config();
        let mut request = UpdateRequest::for_rm(config.cluster_id.clone());
        request.releases = releases;
        if let Err(e) = ctx.scheduler().update(request).await {
            warn!(application_id = %self.application_id, error = %e, "failed to release allocations");
        }
    }

    /// Compare-and-set gate for the single allowed completion handler.
    pub fn try_begin_completion_handler(&self) -> bool {
        self.completion_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Undo the gate when the handler could not actually start.
    pub fn abort_completion_handler(&self) {
        self.completion_running.store(false, Ordering::SeqCst);
    }

    pub fn set_completion_handler(&self, handle: CompletionHandle) {
        *self.completion.lock().unwrap() = Some(handle);
    }

    pub fn stop_completion_handler(&self) {
        if let Some(handle) = self.completion.lock().unwrap().take() {
            handle.stop();
        }
        self.completion_running.store(false, Ordering::SeqCst);
    }
}
