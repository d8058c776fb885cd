//! Cluster node entities and their registry.
//!
//! Nodes are driven by orchestrator informer callbacks: add reports the
//! node to scheduler-core through the recovery transition, cordon toggles
//! map to drain/restore, resource changes are reported as node updates, and
//! deletes decommission the node.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::{ClusterNode, Pod};
use crate::cache::external::SchedulerCache;
use crate::common::utils::get_queue_name;
use crate::common::Resource;
use crate::config::ShimConfig;
use crate::constants::DEFAULT_PARTITION;
use crate::core::types::{Allocation, NewNodeInfo, NodeAction, UpdateRequest, UpdatedNodeInfo};
use crate::core::SchedulerApi;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ShimError};
use crate::events::{NodeEvent, NodeVerb};
use crate::state_machine::{NodeState, StateMachine, StateMachineError, Transition};

static NODE_TRANSITIONS: &[Transition<NodeState, NodeVerb>] = &[
    Transition {
        verb: NodeVerb::Recover,
        from: &[NodeState::New],
        to: NodeState::Recovering,
    },
    Transition {
        verb: NodeVerb::Accept,
        from: &[NodeState::Recovering],
        to: NodeState::Healthy,
    },
    Transition {
        verb: NodeVerb::Drain,
        from: &[NodeState::Healthy],
        to: NodeState::Draining,
    },
    Transition {
        verb: NodeVerb::Restore,
        from: &[NodeState::Draining],
        to: NodeState::Healthy,
    },
    Transition {
        verb: NodeVerb::Unhealthy,
        from: &[NodeState::Healthy],
        to: NodeState::Unhealthy,
    },
    Transition {
        verb: NodeVerb::Decommission,
        from: &[
            NodeState::New,
            NodeState::Recovering,
            NodeState::Healthy,
            NodeState::Draining,
            NodeState::Unhealthy,
        ],
        to: NodeState::Decommissioned,
    },
];

struct NodeInner {
    sm: StateMachine<NodeState, NodeVerb>,
    capacity: Resource,
    schedulable: bool,
    occupied: Resource,
    existing_allocations: Vec<Allocation>,
}

pub struct SchedulerNode {
    name: String,
    uid: String,
    scheduler: Arc<dyn SchedulerApi>,
    config: Arc<ShimConfig>,
    inner: RwLock<NodeInner>,
}

impl SchedulerNode {
    fn new(
        node: &ClusterNode,
        scheduler: Arc<dyn SchedulerApi>,
        config: Arc<ShimConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: node.name.clone(),
            uid: node.uid.clone(),
            scheduler,
            config,
            inner: RwLock::new(NodeInner {
                sm: StateMachine::new(NodeState::New, NODE_TRANSITIONS),
                capacity: node.capacity.clone(),
                schedulable: !node.unschedulable,
                occupied: Resource::new(),
                existing_allocations: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub async fn state(&self) -> NodeState {
        self.inner.read().await.sm.current()
    }

    pub async fn is_schedulable(&self) -> bool {
        self.inner.read().await.schedulable
    }

    pub async fn capacity(&self) -> Resource {
        self.inner.read().await.capacity.clone()
    }

    async fn set_capacity(&self, capacity: Resource) {
        self.inner.write().await.capacity = capacity;
    }

    async fn add_existing_allocation(&self, allocation: Allocation) {
        let mut inner = self.inner.write().await;
        inner.occupied = inner.occupied.add(&allocation.resource);
        inner.existing_allocations.push(allocation);
    }

    pub async fn existing_allocation_count(&self) -> usize {
        self.inner.read().await.existing_allocations.len()
    }

    pub async fn can_handle(&self, verb: NodeVerb) -> bool {
        self.inner.read().await.sm.can(verb)
    }

    pub async fn handle(&self, event: &NodeEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        debug!(
            node = %self.name,
            state = %inner.sm.current(),
            verb = %event.verb,
            "node state transition"
        );
        if !inner.sm.can(event.verb) {
            return Err(ShimError::InvalidTransition {
                entity: "node",
                id: self.name.clone(),
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

    async fn on_event(&self, inner: &mut NodeInner, event: &NodeEvent) -> Result<()> {
        match event.verb {
            NodeVerb::Recover => self.on_recover(inner).await,
            NodeVerb::Drain => {
                inner.schedulable = false;
                self.report_schedulability(NodeAction::Drain, false).await;
                Ok(())
            }
            NodeVerb::Restore => {
                inner.schedulable = true;
                self.report_schedulability(NodeAction::Restore, true).await;
                Ok(())
            }
            NodeVerb::Unhealthy => {
                warn!(node = %self.name, "node marked unhealthy");
                Ok(())
            }
            NodeVerb::Accept | NodeVerb::Decommission => Ok(()),
        }
    }

    /// Report the node (and any allocations recovered onto it) to
    /// scheduler-core. A transient RPC failure aborts the transition so the
    /// node stays New and a later informer resync retries.
    async fn on_recover(&self, inner: &mut NodeInner) -> Result<()> {
        info!(node = %self.name, "reporting node to scheduler-core");
        let mut request = UpdateRequest::for_rm(self.config.cluster_id.clone());
        request.new_nodes.push(NewNodeInfo {
            node_id: self.name.clone(),
            attributes: HashMap::new(),
            schedulable_resource: inner.capacity.clone(),
            occupied_resource: inner.occupied.clone(),
            existing_allocations: inner.existing_allocations.clone(),
        });

        self.scheduler.update(request).await.map_err(|e| {
            warn!(node = %self.name, error = %e, "failed to report node");
            e
        })
    }

    async fn report_schedulability(&self, action: NodeAction, schedulable: bool) {
        info!(node = %self.name, schedulable, "reporting node schedulability change");
        let mut request = UpdateRequest::for_rm(self.config.cluster_id.clone());
        request.updated_nodes.push(UpdatedNodeInfo {
            node_id: self.name.clone(),
            action,
            schedulable,
            schedulable_resource: None,
        });
        if let Err(e) = self.scheduler.update(request).await {
            warn!(node = %self.name, error = %e, "failed to report node update");
        }
    }
}

/// Registry of cluster nodes, keyed by name. The set of entries always
/// equals the set of currently-known orchestrator nodes.
pub struct SchedulerNodes {
    nodes_map: StdRwLock<HashMap<String, Arc<SchedulerNode>>>,
    cache: Arc<SchedulerCache>,
    scheduler: Arc<dyn SchedulerApi>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ShimConfig>,
}

impl SchedulerNodes {
    pub fn new(
        cache: Arc<SchedulerCache>,
        scheduler: Arc<dyn SchedulerApi>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<ShimConfig>,
    ) -> Self {
        Self {
            nodes_map: StdRwLock::new(HashMap::new()),
            cache,
            scheduler,
            dispatcher,
            config,
        }
    }

    pub fn get_node(&self, name: &str) -> Option<Arc<SchedulerNode>> {
        self.nodes_map.read().unwrap().get(name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes_map.read().unwrap().keys().cloned().collect()
    }

    /// Add a node and kick off its recovery report.
    pub async fn add_node(&self, node: &ClusterNode) {
        self.add_node_internal(node, true).await;
    }

    /// Insert without dispatching recovery; the shim's startup recovery
    /// registers allocations first and dispatches recovery itself.
    pub async fn add_node_silently(&self, node: &ClusterNode) {
        self.add_node_internal(node, false).await;
    }

    async fn add_node_internal(&self, node: &ClusterNode, report: bool) {
        {
            let mut nodes = self.nodes_map.write().unwrap();
            if !nodes.contains_key(&node.name) {
                info!(
                    node = %node.name,
                    uid = %node.uid,
                    schedulable = !node.unschedulable,
                    "adding node to context"
                );
                nodes.insert(
                    node.name.clone(),
                    SchedulerNode::new(node, self.scheduler.clone(), self.config.clone()),
                );
            }
        }

        // A node may already be past recovery from a previous informer
        // resync; only New nodes get the recovery kick.
        if report {
            self.dispatch_recover_if_new(&node.name).await;
        }
    }

    pub async fn dispatch_recover_if_new(&self, name: &str) {
        if let Some(node) = self.get_node(name) {
            if node.state().await == NodeState::New {
                if let Err(e) = self
                    .dispatcher
                    .dispatch(NodeEvent::new(name, NodeVerb::Recover))
                {
                    warn!(node = name, error = %e, "failed to dispatch node recovery");
                }
            }
        }
    }

    /// Register a pre-existing allocation (an already-assigned pod found
    /// during recovery) on its node.
    pub async fn add_existing_allocation(&self, pod: &Pod, application_id: &str) -> Result<()> {
        let node_name = pod
            .node_name
            .clone()
            .ok_or_else(|| ShimError::invariant(format!("pod {} is not assigned", pod.uid)))?;
        let node = self.get_node(&node_name).ok_or_else(|| {
            ShimError::invariant(format!("node {node_name} not found for existing allocation"))
        })?;

        node.add_existing_allocation(Allocation {
            allocation_key: pod.name.clone(),
            uuid: pod.uid.clone(),
            resource: pod.resources.clone(),
            node_id: node_name,
            application_id: application_id.to_string(),
            partition_name: DEFAULT_PARTITION.to_string(),
            queue_name: get_queue_name(pod),
            tags: None,
        })
        .await;
        Ok(())
    }

    /// React to an orchestrator node update: cordon toggles become
    /// drain/restore, resource changes are reported to scheduler-core.
    pub async fn update_node(&self, old: &ClusterNode, new: &ClusterNode) {
        if !old.unschedulable && new.unschedulable {
            self.drain_node(&new.name).await;
        } else if old.unschedulable && !new.unschedulable {
            self.restore_node(&new.name).await;
        }

        if old.capacity == new.capacity {
            debug!(node = %new.name, "node resources unchanged, skipping update");
            return;
        }

        if let Some(node) = self.get_node(&new.name) {
            node.set_capacity(new.capacity.clone()).await;
            let mut request = UpdateRequest::for_rm(self.config.cluster_id.clone());
            request.updated_nodes.push(UpdatedNodeInfo {
                node_id: new.name.clone(),
                action: NodeAction::Update,
                schedulable: node.is_schedulable().await,
                schedulable_resource: Some(new.capacity.clone()),
            });
            info!(node = %new.name, "reporting updated node resources to scheduler-core");
            if let Err(e) = self.scheduler.update(request).await {
                warn!(node = %new.name, error = %e, "failed to report node update");
            }
        }
    }

    async fn drain_node(&self, name: &str) {
        info!(node = name, "draining node");
        if let Some(node) = self.get_node(name) {
            if node.state().await == NodeState::Healthy {
                if let Err(e) = self.dispatcher.dispatch(NodeEvent::new(name, NodeVerb::Drain)) {
                    warn!(node = name, error = %e, "failed to dispatch drain");
                }
            }
        }
    }

    async fn restore_node(&self, name: &str) {
        info!(node = name, "restoring node");
        if let Some(node) = self.get_node(name) {
            if node.state().await == NodeState::Draining {
                if let Err(e) = self
                    .dispatcher
                    .dispatch(NodeEvent::new(name, NodeVerb::Restore))
                {
                    warn!(node = name, error = %e, "failed to dispatch restore");
                }
            }
        }
    }

    /// Report the removal to scheduler-core and drop the entry.
    pub async fn delete_node(&self, name: &str) {
        let node = { self.nodes_map.write().unwrap().remove(name) };
        let Some(node) = node else {
            debug!(node = name, "delete for unknown node");
            return;
        };

        let mut request = UpdateRequest::for_rm(self.config.cluster_id.clone());
        request.updated_nodes.push(UpdatedNodeInfo {
            node_id: name.to_string(),
            action: NodeAction::Decommission,
            schedulable: false,
            schedulable_resource: None,
        });
        info!(node = name, "reporting node removal to scheduler-core");
        if let Err(e) = self.scheduler.update(request).await {
            warn!(node = name, error = %e, "failed to report node removal");
        }

        if let Err(e) = node
            .handle(&NodeEvent::new(name, NodeVerb::Decommission))
            .await
        {
            debug!(node = name, error = %e, "decommission transition skipped");
        }
        self.cache.remove_node(name);
    }

    /// Dispatcher target for node events.
    pub async fn handle_node_event(&self, event: NodeEvent) {
        let Some(node) = self.get_node(&event.node_id) else {
            warn!(node = %event.node_id, "event for unknown node dropped");
            return;
        };
        if node.can_handle(event.verb).await {
            if let Err(e) = node.handle(&event).await {
                warn!(
                    node = %event.node_id,
                    verb = %event.verb,
                    error = %e,
                    "failed to handle node event"
                );
            }
        } else {
            debug!(
                node = %event.node_id,
                verb = %event.verb,
                "node event not applicable in current state, dropped"
            );
        }
    }
}
