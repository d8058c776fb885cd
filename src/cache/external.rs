//! Mirror of orchestrator node and pod state.
//!
//! This cache is the physical-world view consumed by the predicate
//! evaluator and by assume-bookkeeping. It is kept in sync purely by
//! informer callbacks; there is no polling reconciliation. Assumed pods are
//! stored as an overlay so forgetting one restores the cache to its prior
//! observable state.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::api::{ClusterNode, Pod};

#[derive(Debug, Clone)]
struct AssumedPod {
    pod: Pod,
    all_volumes_bound: bool,
}

#[derive(Default)]
struct CacheInner {
    nodes: HashMap<String, ClusterNode>,
    pods: HashMap<String, Pod>,
    assumed: HashMap<String, AssumedPod>,
}

#[derive(Default)]
pub struct SchedulerCache {
    inner: RwLock<CacheInner>,
}

impl SchedulerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: &ClusterNode) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(node.name.clone(), node.clone());
    }

    pub fn update_node(&self, node: &ClusterNode) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(node.name.clone(), node.clone());
    }

    pub fn remove_node(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.remove(name);
    }

    pub fn get_node(&self, name: &str) -> Option<ClusterNode> {
        let inner = self.inner.read().unwrap();
        inner.nodes.get(name).cloned()
    }

    /// Snapshot of the full node map, used to build predicate metadata.
    pub fn nodes_snapshot(&self) -> HashMap<String, ClusterNode> {
        let inner = self.inner.read().unwrap();
        inner.nodes.clone()
    }

    pub fn add_pod(&self, pod: &Pod) {
        let mut inner = self.inner.write().unwrap();
        inner.pods.insert(pod.uid.clone(), pod.clone());
    }

    pub fn update_pod(&self, pod: &Pod) {
        let mut inner = self.inner.write().unwrap();
        inner.pods.insert(pod.uid.clone(), pod.clone());
    }

    /// Drop a pod and any assumption recorded for it.
    pub fn remove_pod(&self, uid: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.pods.remove(uid);
        inner.assumed.remove(uid);
    }

    /// The pod as the scheduler currently sees it: the assumed copy when one
    /// exists, otherwise the informer's version.
    pub fn get_pod(&self, uid: &str) -> Option<Pod> {
        let inner = self.inner.read().unwrap();
        inner
            .assumed
            .get(uid)
            .map(|a| a.pod.clone())
            .or_else(|| inner.pods.get(uid).cloned())
    }

    /// Record a provisional pod-to-node assignment. The caller passes a
    /// copy already stamped with the node name; the informer's original is
    /// never mutated.
    pub fn assume_pod(&self, pod: Pod, all_volumes_bound: bool) {
        let mut inner = self.inner.write().unwrap();
        inner.assumed.insert(
            pod.uid.clone(),
            AssumedPod {
                pod,
                all_volumes_bound,
            },
        );
    }

    /// Drop an assumption. Idempotent; a missing pod is not an error.
    pub fn forget_pod(&self, uid: &str) {
        let mut inner = self.inner.write().unwrap();
        if inner.assumed.remove(uid).is_none() {
            debug!(uid, "forget: pod was not assumed");
        }
    }

    pub fn is_assumed(&self, uid: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.assumed.contains_key(uid)
    }

    /// Whether an assumed pod had all of its volumes bound at assume time.
    pub fn are_pod_volumes_all_bound(&self, uid: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .assumed
            .get(uid)
            .map(|a| a.all_volumes_bound)
            .unwrap_or(false)
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node_for_test, PodBuilder};

    #[test]
    fn assume_then_forget_restores_prior_state() {
        let cache = SchedulerCache::new();
        let pod = PodBuilder::new("p1").uid("t1").app_id("app-1").build();
        cache.add_pod(&pod);
        cache.add_node(&node_for_test("n1", 4000, 8192));

        let before = cache.get_pod("t1").unwrap();
        assert!(before.node_name.is_none());

        let mut assumed = before.clone();
        assumed.node_name = Some("n1".to_string());
        cache.assume_pod(assumed, true);

        assert!(cache.is_assumed("t1"));
        assert_eq!(
            cache.get_pod("t1").unwrap().node_name.as_deref(),
            Some("n1")
        );

        cache.forget_pod("t1");
        assert!(!cache.is_assumed("t1"));
        assert_eq!(cache.get_pod("t1").unwrap(), before);
    }

    #[test]
    fn forget_is_idempotent() {
        let cache = SchedulerCache::new();
        cache.forget_pod("missing");
        cache.forget_pod("missing");
    }

    #[test]
    fn remove_pod_drops_assumption() {
        let cache = SchedulerCache::new();
        let pod = PodBuilder::new("p1").uid("t1").build();
        cache.add_pod(&pod);
        let mut assumed = pod.clone();
        assumed.node_name = Some("n1".to_string());
        cache.assume_pod(assumed, false);

        cache.remove_pod("t1");
        assert!(cache.get_pod("t1").is_none());
        assert!(!cache.is_assumed("t1"));
    }

    #[test]
    fn volume_bound_flag_is_tracked() {
        let cache = SchedulerCache::new();
        let pod = PodBuilder::new("p1").uid("t1").build();
        cache.add_pod(&pod);
        assert!(!cache.are_pod_volumes_all_bound("t1"));

        let mut assumed = pod.clone();
        assumed.node_name = Some("n1".to_string());
        cache.assume_pod(assumed, true);
        assert!(cache.are_pod_volumes_all_bound("t1"));
    }
}
