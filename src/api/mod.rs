//! # Orchestrator Object Model
//!
//! The shim's view of orchestrator objects. The orchestrator client is an
//! abstracted collaborator; these types carry exactly the fields the shim
//! reads, nothing more.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::Resource;

/// Pod lifecycle phase as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// A workload pod. `uid` is the orchestrator-assigned unique id and doubles
/// as the shim's task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    /// Scheduler the pod requests; only pods naming this shim are eligible.
    pub scheduler_name: String,
    /// Service account, used as the application's user identity.
    pub service_account: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Node the pod is (or is assumed to be) running on.
    pub node_name: Option<String>,
    pub phase: PodPhase,
    /// Sum of the pod's container resource requests.
    pub resources: Resource,
}

impl Pod {
    /// Whether the orchestrator has already placed this pod on a node.
    pub fn is_assigned(&self) -> bool {
        self.node_name.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A cluster node as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    pub uid: String,
    /// Orchestrator-side cordon flag.
    pub unschedulable: bool,
    pub capacity: Resource,
}

/// A configuration object; only the named scheduler ConfigMap is relevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub name: String,
    pub data: HashMap<String, String>,
}

/// One delivery on a pod watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl WatchEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            WatchEvent::Added(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_requires_nonempty_node() {
        let mut pod = Pod {
            uid: "u1".to_string(),
            name: "p1".to_string(),
            namespace: "default".to_string(),
            scheduler_name: "berth".to_string(),
            service_account: "sa".to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            node_name: None,
            phase: PodPhase::Pending,
            resources: Resource::new(),
        };
        assert!(!pod.is_assigned());

        pod.node_name = Some(String::new());
        assert!(!pod.is_assigned());

        pod.node_name = Some("n1".to_string());
        assert!(pod.is_assigned());
    }
}
