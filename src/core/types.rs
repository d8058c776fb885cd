//! Wire values exchanged with scheduler-core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::Resource;

/// Registration handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub rm_id: String,
    pub version: String,
    pub policy_group: String,
}

/// The single outbound update call; any combination of sections may be
/// populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub rm_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_applications: Vec<AddApplicationRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_nodes: Vec<NewNodeInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_nodes: Vec<UpdatedNodeInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asks: Vec<AllocationAsk>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<AllocationRelease>,
}

impl UpdateRequest {
    pub fn for_rm(rm_id: impl Into<String>) -> Self {
        Self {
            rm_id: rm_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddApplicationRequest {
    pub application_id: String,
    pub queue_name: String,
    pub partition_name: String,
    pub user: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNodeInfo {
    pub node_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub schedulable_resource: Resource,
    pub occupied_resource: Resource,
    /// Allocations already running on the node, reported during recovery.
    #[serde(default)]
    pub existing_allocations: Vec<Allocation>,
}

/// Schedulability / resource delta for a known node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Update,
    Drain,
    Restore,
    Decommission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedNodeInfo {
    pub node_id: String,
    pub action: NodeAction,
    pub schedulable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedulable_resource: Option<Resource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationAsk {
    pub application_id: String,
    /// Task-scoped key; by convention the pod uid.
    pub allocation_key: String,
    pub resource: Resource,
    pub queue_name: String,
    pub partition_name: String,
    pub max_allocations: i32,
}

/// Scheduler-core's placement decision for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_key: String,
    /// Assigned by scheduler-core; the shim mirrors but never invents it.
    pub uuid: String,
    pub resource: Resource,
    pub node_id: String,
    pub application_id: String,
    pub partition_name: String,
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    TimedOut,
    Killed,
    Stopped,
    Preempted,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRelease {
    pub application_id: String,
    pub allocation_uuid: String,
    pub partition_name: String,
    pub reason: ReleaseReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ResourceBuilder;

    #[test]
    fn empty_sections_are_skipped_on_the_wire() {
        let request = UpdateRequest::for_rm("cluster-1");
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("new_applications"));
        assert!(!json.contains("releases"));
    }

    #[test]
    fn allocation_round_trips() {
        let alloc = Allocation {
            allocation_key: "t1".to_string(),
            uuid: "uuid-1".to_string(),
            resource: ResourceBuilder::new().cpu_milli(1000).build(),
            node_id: "n1".to_string(),
            application_id: "app-1".to_string(),
            partition_name: "default".to_string(),
            queue_name: "root.default".to_string(),
            tags: None,
        };
        let json = serde_json::to_string(&alloc).unwrap();
        let parsed: Allocation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, alloc);
    }

    #[test]
    fn release_reason_serializes_snake_case() {
        let json = serde_json::to_string(&ReleaseReason::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
