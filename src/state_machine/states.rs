use serde::{Deserialize, Serialize};
use std::fmt;

/// Application lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    /// Initial state when the application is registered with the context
    New,
    /// Submitted to scheduler-core, waiting for a verdict
    Submitted,
    /// Accepted by scheduler-core
    Accepted,
    /// At least one scheduling pass has run
    Running,
    /// Recovered from pre-existing orchestrator state, waiting for accept
    Recovering,
    /// Scheduler-core refused the submission
    Rejected,
    /// All work finished
    Completed,
    /// Kill requested, waiting for confirmation
    Killing,
    /// Kill confirmed
    Killed,
    /// Terminal failure
    Failed,
}

impl ApplicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Killed | Self::Failed)
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Accepted => write!(f, "Accepted"),
            Self::Running => write!(f, "Running"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Completed => write!(f, "Completed"),
            Self::Killing => write!(f, "Killing"),
            Self::Killed => write!(f, "Killed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    /// Announced to scheduler-core as a pending ask
    Pending,
    /// Waiting for an allocation decision
    Scheduling,
    /// Scheduler-core assigned a node; pod is assumed on it
    Allocated,
    /// Bound through the orchestrator API
    Bound,
    /// Ask refused by scheduler-core
    Rejected,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }

    /// States in which the task holds an allocation UUID.
    pub fn holds_allocation(&self) -> bool {
        matches!(self, Self::Allocated | Self::Bound | Self::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Pending => write!(f, "Pending"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Allocated => write!(f, "Allocated"),
            Self::Bound => write!(f, "Bound"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Node lifecycle states. A node in `Draining` is reported to
/// scheduler-core as un-schedulable but retains its allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    New,
    /// Reported to scheduler-core, waiting for acknowledgement
    Recovering,
    Healthy,
    Draining,
    Unhealthy,
    /// Removed from the cluster
    Decommissioned,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Decommissioned)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Healthy => write!(f, "Healthy"),
            Self::Draining => write!(f, "Draining"),
            Self::Unhealthy => write!(f, "Unhealthy"),
            Self::Decommissioned => write!(f, "Decommissioned"),
        }
    }
}

/// Shim scheduler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Created,
    Registering,
    Registered,
    Recovering,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Registering => write!(f, "Registering"),
            Self::Registered => write!(f, "Registered"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Running => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ApplicationState::Failed.is_terminal());
        assert!(ApplicationState::Completed.is_terminal());
        assert!(!ApplicationState::Running.is_terminal());

        assert!(TaskState::Rejected.is_terminal());
        assert!(!TaskState::Bound.is_terminal());

        assert!(NodeState::Decommissioned.is_terminal());
        assert!(!NodeState::Draining.is_terminal());
    }

    #[test]
    fn allocation_holding_states() {
        assert!(TaskState::Allocated.holds_allocation());
        assert!(TaskState::Bound.holds_allocation());
        assert!(TaskState::Completed.holds_allocation());
        assert!(!TaskState::Failed.holds_allocation());
        assert!(!TaskState::Scheduling.holds_allocation());
    }

    #[test]
    fn state_serde() {
        let json = serde_json::to_string(&TaskState::Scheduling).unwrap();
        assert_eq!(json, "\"scheduling\"");
        let parsed: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskState::Scheduling);
    }
}
