//! # Orchestrator Client Seam
//!
//! Traits the concrete orchestrator integration implements. Informer
//! wiring, TLS, and API plumbing live outside this crate; the shim only
//! depends on these calls.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::{ClusterNode, Pod, WatchEvent};
use crate::config::ShimConfig;
use crate::error::Result;

/// Stream of pod watch deliveries. The channel closing means the watch
/// ended without further events; callers reconnect or exit silently.
pub type PodWatch = mpsc::Receiver<WatchEvent>;

/// Outbound calls against the orchestrator API.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Bind a pod to a node. Errors are classified transient/permanent by
    /// the crate error type.
    async fn bind_pod(&self, pod_uid: &str, node_name: &str) -> Result<()>;

    async fn delete_pod(&self, pod_uid: &str) -> Result<()>;

    /// Current node set, used during recovery.
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>>;

    /// Current pod set, used during recovery.
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// Open a watch over pods in a namespace.
    async fn watch_pods(&self, namespace: &str) -> Result<PodWatch>;
}

/// Optional volume pre-binding support.
#[async_trait]
pub trait VolumeBinder: Send + Sync {
    /// Reserve the pod's volumes on the node. Returns whether all volumes
    /// are already bound (`true` lets the bind skip `bind_pod_volumes`).
    async fn assume_pod_volumes(&self, pod: &Pod, node_name: &str) -> Result<bool>;

    /// Bind any volumes `assume_pod_volumes` left unbound.
    async fn bind_pod_volumes(&self, pod: &Pod) -> Result<()>;
}

/// Bundle of orchestrator-facing collaborators handed to the shim at
/// startup.
#[derive(Clone)]
pub struct ApiProvider {
    client: Arc<dyn OrchestratorClient>,
    volume_binder: Option<Arc<dyn VolumeBinder>>,
    config: Arc<ShimConfig>,
}

impl ApiProvider {
    pub fn new(
        client: Arc<dyn OrchestratorClient>,
        volume_binder: Option<Arc<dyn VolumeBinder>>,
        config: Arc<ShimConfig>,
    ) -> Self {
        Self {
            client,
            volume_binder,
            config,
        }
    }

    pub fn client(&self) -> &Arc<dyn OrchestratorClient> {
        &self.client
    }

    pub fn volume_binder(&self) -> Option<&Arc<dyn VolumeBinder>> {
        self.volume_binder.as_ref()
    }

    pub fn config(&self) -> &Arc<ShimConfig> {
        &self.config
    }
}
