//! # Scheduling Cache
//!
//! The scheduler-world state: application and node registries, task
//! entities, and the orchestrator-mirror cache feeding predicate evaluation
//! and assume-bookkeeping. The [`Context`] is the single entry point for
//! structural mutation.

pub mod application;
pub mod context;
pub mod external;
pub mod nodes;
pub mod task;

use chrono::{DateTime, Utc};

pub use application::Application;
pub use context::{ApplicationMetadata, Context};
pub use external::SchedulerCache;
pub use nodes::{SchedulerNode, SchedulerNodes};
pub use task::Task;

/// Why and when an entity reached a terminal failure state.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
