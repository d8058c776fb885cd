//! # Predicate Evaluation
//!
//! Pluggable pre-filtering of candidate nodes. The concrete predicate
//! library is a collaborator; the shim ships only the seam and a basic
//! resource-fit evaluator. With no evaluator installed (testing mode),
//! every pod fits every node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::api::{ClusterNode, Pod};
use crate::constants::resources;

/// Cluster-wide context handed to predicates, built from the full node map.
pub struct PredicateMeta {
    nodes: HashMap<String, ClusterNode>,
}

impl PredicateMeta {
    pub fn new(nodes: HashMap<String, ClusterNode>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &HashMap<String, ClusterNode> {
        &self.nodes
    }
}

/// The first failing predicate, by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateFailure {
    pub predicate: String,
    pub reason: String,
}

impl fmt::Display for PredicateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "predicate {} failed: {}", self.predicate, self.reason)
    }
}

/// A pure boolean function over (pod, cluster-state, node).
pub trait PredicateEvaluator: Send + Sync {
    fn evaluate(
        &self,
        pod: &Pod,
        meta: &PredicateMeta,
        node: &ClusterNode,
    ) -> Result<(), PredicateFailure>;
}

/// Wrapper deciding whether predicates run at all.
#[derive(Clone)]
pub struct Predictor {
    evaluator: Option<Arc<dyn PredicateEvaluator>>,
}

impl Predictor {
    pub fn new(evaluator: Arc<dyn PredicateEvaluator>) -> Self {
        Self {
            evaluator: Some(evaluator),
        }
    }

    /// Predicate evaluation switched off, e.g. in testing mode.
    pub fn disabled() -> Self {
        Self { evaluator: None }
    }

    pub fn enabled(&self) -> bool {
        self.evaluator.is_some()
    }

    pub fn predicates(
        &self,
        pod: &Pod,
        meta: &PredicateMeta,
        node: &ClusterNode,
    ) -> Result<(), PredicateFailure> {
        match &self.evaluator {
            Some(evaluator) => evaluator.evaluate(pod, meta, node),
            None => Ok(()),
        }
    }
}

/// Baseline evaluator: the pod's resource request must fit the node's
/// capacity and the node must not be cordoned.
pub struct ResourceFitEvaluator;

impl PredicateEvaluator for ResourceFitEvaluator {
    fn evaluate(
        &self,
        pod: &Pod,
        _meta: &PredicateMeta,
        node: &ClusterNode,
    ) -> Result<(), PredicateFailure> {
        if node.unschedulable {
            return Err(PredicateFailure {
                predicate: "node_schedulable".to_string(),
                reason: format!("node {} is cordoned", node.name),
            });
        }
        if !pod.resources.fits_in(&node.capacity) {
            return Err(PredicateFailure {
                predicate: "resource_fit".to_string(),
                reason: format!(
                    "pod requests cpu={} memory={} beyond node {} capacity",
                    pod.resources.get(resources::CPU),
                    pod.resources.get(resources::MEMORY),
                    node.name
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node_for_test, PodBuilder};

    #[test]
    fn disabled_predictor_accepts_everything() {
        let predictor = Predictor::disabled();
        assert!(!predictor.enabled());

        let pod = PodBuilder::new("p1").cpu_milli(100_000).build();
        let node = node_for_test("n1", 1000, 1024);
        let meta = PredicateMeta::new(HashMap::new());
        assert!(predictor.predicates(&pod, &meta, &node).is_ok());
    }

    #[test]
    fn resource_fit_names_the_failing_predicate() {
        let predictor = Predictor::new(Arc::new(ResourceFitEvaluator));
        let meta = PredicateMeta::new(HashMap::new());
        let node = node_for_test("n1", 1000, 1024);

        let small = PodBuilder::new("p1").cpu_milli(500).memory_mi(512).build();
        assert!(predictor.predicates(&small, &meta, &node).is_ok());

        let big = PodBuilder::new("p2").cpu_milli(2000).build();
        let failure = predictor.predicates(&big, &meta, &node).unwrap_err();
        assert_eq!(failure.predicate, "resource_fit");
    }

    #[test]
    fn cordoned_node_fails_schedulability_predicate() {
        let predictor = Predictor::new(Arc::new(ResourceFitEvaluator));
        let meta = PredicateMeta::new(HashMap::new());
        let mut node = node_for_test("n1", 4000, 8192);
        node.unschedulable = true;

        let pod = PodBuilder::new("p1").cpu_milli(100).build();
        let failure = predictor.predicates(&pod, &meta, &node).unwrap_err();
        assert_eq!(failure.predicate, "node_schedulable");
    }
}
