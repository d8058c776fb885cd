//! # Scheduler-Core Proxy
//!
//! The outbound RPC surface of the remote scheduler-core engine, plus the
//! inbound callback adapter that turns its decisions into dispatcher
//! events. Transport concerns live in the implementation supplied by the
//! embedder; the shim only sees this trait.

pub mod callback;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use callback::RmCallback;
pub use types::{
    AddApplicationRequest, Allocation, AllocationAsk, AllocationRelease, NewNodeInfo, NodeAction,
    RegisterRequest, ReleaseReason, UpdateRequest, UpdatedNodeInfo,
};

/// Outbound calls to scheduler-core. Implementations attach per-call
/// deadlines; timeouts surface as [`crate::ShimError::Transient`].
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// One-time resource-manager registration handshake.
    async fn register(&self, request: RegisterRequest) -> Result<()>;

    /// Deliver any combination of application/node/ask/release updates.
    async fn update(&self, request: UpdateRequest) -> Result<()>;

    /// Ask scheduler-core to re-read its configuration for this cluster.
    async fn reload_configuration(&self, cluster_id: &str) -> Result<()>;
}
