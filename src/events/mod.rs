//! # Event Types
//!
//! Immutable event values routed through the [`crate::dispatcher`]. Events
//! come in four kinds, one per target entity family; each carries the
//! target's id, a verb, and verb-specific arguments.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Verbs driving the application state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationVerb {
    Submit,
    Recover,
    Accept,
    Run,
    Complete,
    Reject,
    Fail,
    Kill,
    Killed,
}

impl fmt::Display for ApplicationVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submit => "submit_application",
            Self::Recover => "recover_application",
            Self::Accept => "accept_application",
            Self::Run => "run_application",
            Self::Complete => "complete_application",
            Self::Reject => "reject_application",
            Self::Fail => "fail_application",
            Self::Kill => "kill_application",
            Self::Killed => "application_killed",
        };
        write!(f, "{name}")
    }
}

/// Verbs driving the task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskVerb {
    Init,
    Schedule,
    Allocated,
    Bind,
    Complete,
    Fail,
    Reject,
}

impl fmt::Display for TaskVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init_task",
            Self::Schedule => "schedule_task",
            Self::Allocated => "task_allocated",
            Self::Bind => "bind_task",
            Self::Complete => "complete_task",
            Self::Fail => "fail_task",
            Self::Reject => "reject_task",
        };
        write!(f, "{name}")
    }
}

/// Verbs driving the node state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeVerb {
    Recover,
    Accept,
    Drain,
    Restore,
    Unhealthy,
    Decommission,
}

impl fmt::Display for NodeVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recover => "recover_node",
            Self::Accept => "accept_node",
            Self::Drain => "drain_node",
            Self::Restore => "restore_node",
            Self::Unhealthy => "node_unhealthy",
            Self::Decommission => "decommission_node",
        };
        write!(f, "{name}")
    }
}

/// Verbs driving the shim scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerVerb {
    Register,
    Registered,
    Recover,
    RecoverComplete,
    Drain,
    Stop,
}

impl fmt::Display for SchedulerVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Register => "register_scheduler",
            Self::Registered => "scheduler_registered",
            Self::Recover => "recover_scheduler",
            Self::RecoverComplete => "scheduler_recover_complete",
            Self::Drain => "drain_scheduler",
            Self::Stop => "stop_scheduler",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationEvent {
    pub application_id: String,
    pub verb: ApplicationVerb,
    /// Failure/rejection reason, where the verb carries one.
    pub reason: Option<String>,
}

impl ApplicationEvent {
    pub fn simple(application_id: impl Into<String>, verb: ApplicationVerb) -> Self {
        Self {
            application_id: application_id.into(),
            verb,
            reason: None,
        }
    }

    pub fn fail(application_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            verb: ApplicationVerb::Fail,
            reason: Some(reason.into()),
        }
    }

    pub fn reject(application_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            verb: ApplicationVerb::Reject,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub application_id: String,
    pub task_id: String,
    pub verb: TaskVerb,
    /// Target node, set on `Allocated`.
    pub node_id: Option<String>,
    /// Scheduler-core allocation UUID, set on `Allocated`.
    pub allocation_uuid: Option<String>,
    pub reason: Option<String>,
}

impl TaskEvent {
    pub fn simple(
        application_id: impl Into<String>,
        task_id: impl Into<String>,
        verb: TaskVerb,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            task_id: task_id.into(),
            verb,
            node_id: None,
            allocation_uuid: None,
            reason: None,
        }
    }

    pub fn allocated(
        application_id: impl Into<String>,
        task_id: impl Into<String>,
        node_id: impl Into<String>,
        allocation_uuid: impl Into<String>,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            task_id: task_id.into(),
            verb: TaskVerb::Allocated,
            node_id: Some(node_id.into()),
            allocation_uuid: Some(allocation_uuid.into()),
            reason: None,
        }
    }

    pub fn fail(
        application_id: impl Into<String>,
        task_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            task_id: task_id.into(),
            verb: TaskVerb::Fail,
            node_id: None,
            allocation_uuid: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub node_id: String,
    pub verb: NodeVerb,
}

impl NodeEvent {
    pub fn new(node_id: impl Into<String>, verb: NodeVerb) -> Self {
        Self {
            node_id: node_id.into(),
            verb,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerEvent {
    pub verb: SchedulerVerb,
}

impl SchedulerEvent {
    pub fn new(verb: SchedulerVerb) -> Self {
        Self { verb }
    }
}

/// A dispatchable event, tagged by kind.
#[derive(Debug, Clone)]
pub enum Event {
    Application(ApplicationEvent),
    Task(TaskEvent),
    Node(NodeEvent),
    Scheduler(SchedulerEvent),
}

impl Event {
    /// Kind name, for logs and backpressure errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Application(_) => "application",
            Event::Task(_) => "task",
            Event::Node(_) => "node",
            Event::Scheduler(_) => "scheduler",
        }
    }
}

impl From<ApplicationEvent> for Event {
    fn from(ev: ApplicationEvent) -> Self {
        Event::Application(ev)
    }
}

impl From<TaskEvent> for Event {
    fn from(ev: TaskEvent) -> Self {
        Event::Task(ev)
    }
}

impl From<NodeEvent> for Event {
    fn from(ev: NodeEvent) -> Self {
        Event::Node(ev)
    }
}

impl From<SchedulerEvent> for Event {
    fn from(ev: SchedulerEvent) -> Self {
        Event::Scheduler(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_fill_args() {
        let ev = TaskEvent::allocated("app-1", "t1", "n1", "uuid-1");
        assert_eq!(ev.verb, TaskVerb::Allocated);
        assert_eq!(ev.node_id.as_deref(), Some("n1"));
        assert_eq!(ev.allocation_uuid.as_deref(), Some("uuid-1"));

        let ev = ApplicationEvent::fail("app-1", "boom");
        assert_eq!(ev.verb, ApplicationVerb::Fail);
        assert_eq!(ev.reason.as_deref(), Some("boom"));
    }

    #[test]
    fn event_kinds() {
        assert_eq!(
            Event::from(ApplicationEvent::simple("a", ApplicationVerb::Run)).kind(),
            "application"
        );
        assert_eq!(
            Event::from(NodeEvent::new("n1", NodeVerb::Drain)).kind(),
            "node"
        );
    }
}
