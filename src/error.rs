//! # Error Taxonomy
//!
//! A single crate-wide error type classifying every failure the shim can
//! hit. The classification drives handling policy: invariant and
//! transition-invalid errors are logged and the offending event dropped,
//! transient errors are retried on the next scheduling tick, permanent
//! errors move the entity to a terminal state, and fatal errors abort
//! startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShimError {
    /// A structural invariant was violated (duplicate task id, unknown
    /// application id, missing cache entry). The triggering event is dropped.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The requested state-machine verb is not legal in the entity's current
    /// state. Idempotent callers re-emit on the next tick.
    #[error("event {verb} not allowed for {entity} {id} in state {state}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        state: String,
        verb: String,
    },

    /// A failure that is expected to clear on retry, such as an RPC timeout
    /// or an orchestrator 5xx. Does not transition the entity.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A failure that will not clear on retry, such as a malformed pod or a
    /// rejection by scheduler-core. Transitions the entity to Failed/Rejected.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable setup failure; the process should exit non-zero.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Dispatch(#[from] crate::dispatcher::DispatchError),

    #[error(transparent)]
    StateMachine(#[from] crate::state_machine::StateMachineError),
}

impl ShimError {
    /// Whether a retry of the same operation can be expected to succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ShimError::Transient(_))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        ShimError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ShimError::Permanent(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        ShimError::Invariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retriable() {
        assert!(ShimError::transient("rpc timeout").is_retriable());
        assert!(!ShimError::permanent("rejected").is_retriable());
        assert!(!ShimError::invariant("duplicate task").is_retriable());
    }

    #[test]
    fn display_carries_context() {
        let err = ShimError::InvalidTransition {
            entity: "task",
            id: "t1".to_string(),
            state: "New".to_string(),
            verb: "bind".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("t1"));
        assert!(msg.contains("bind"));
    }
}
