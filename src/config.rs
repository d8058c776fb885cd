//! Shim configuration: delivered as a struct at startup, refreshed at
//! runtime only through the scheduler-core reload trigger (the shim itself
//! never re-parses configuration).

use std::time::Duration;

use crate::constants;
use crate::error::{Result, ShimError};

#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Cluster identifier announced to scheduler-core as the RM id.
    pub cluster_id: String,
    /// Version string sent at registration.
    pub cluster_version: String,
    /// Scheduler name pods must request to be handled by this shim.
    pub scheduler_name: String,
    /// Interval of the periodic scheduling tick.
    pub scheduling_interval: Duration,
    /// Policy group announced to scheduler-core.
    pub policy_group: String,
    /// Disables predicate evaluation and external side effects in tests.
    pub testing_mode: bool,
    /// Primary label/annotation key holding the application id.
    pub app_id_label: String,
    /// Per-kind dispatcher queue capacity.
    pub dispatcher_capacity: usize,
    /// Upper bound on concurrently running completion-handler watches.
    pub max_completion_watches: usize,
    /// How long recovery waits for scheduler-core accepts before proceeding.
    pub recovery_timeout: Duration,
    /// How long dispatcher consumers drain queued events at shutdown.
    pub drain_timeout: Duration,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            cluster_id: "berth-cluster".to_string(),
            cluster_version: env!("CARGO_PKG_VERSION").to_string(),
            scheduler_name: constants::DEFAULT_SCHEDULER_NAME.to_string(),
            scheduling_interval: Duration::from_secs(1),
            policy_group: constants::DEFAULT_POLICY_GROUP.to_string(),
            testing_mode: false,
            app_id_label: constants::labels::APPLICATION_ID.to_string(),
            dispatcher_capacity: constants::DEFAULT_DISPATCHER_CAPACITY,
            max_completion_watches: constants::DEFAULT_MAX_COMPLETION_WATCHES,
            recovery_timeout: Duration::from_secs(constants::DEFAULT_RECOVERY_TIMEOUT_SECS),
            drain_timeout: Duration::from_secs(constants::DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }
}

impl ShimConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(cluster_id) = std::env::var("BERTH_CLUSTER_ID") {
            config.cluster_id = cluster_id;
        }

        if let Ok(name) = std::env::var("BERTH_SCHEDULER_NAME") {
            config.scheduler_name = name;
        }

        if let Ok(interval_ms) = std::env::var("BERTH_SCHEDULING_INTERVAL_MS") {
            let millis: u64 = interval_ms.parse().map_err(|e| {
                ShimError::Configuration(format!("invalid scheduling interval: {e}"))
            })?;
            config.scheduling_interval = Duration::from_millis(millis);
        }

        if let Ok(capacity) = std::env::var("BERTH_DISPATCHER_CAPACITY") {
            config.dispatcher_capacity = capacity.parse().map_err(|e| {
                ShimError::Configuration(format!("invalid dispatcher capacity: {e}"))
            })?;
        }

        if let Ok(watches) = std::env::var("BERTH_MAX_COMPLETION_WATCHES") {
            config.max_completion_watches = watches.parse().map_err(|e| {
                ShimError::Configuration(format!("invalid completion watch bound: {e}"))
            })?;
        }

        Ok(config)
    }

    /// Configuration used by the integration harness: short intervals,
    /// predicate evaluation off.
    pub fn for_testing(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            testing_mode: true,
            scheduling_interval: Duration::from_millis(20),
            recovery_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = ShimConfig::default();
        assert_eq!(config.scheduler_name, constants::DEFAULT_SCHEDULER_NAME);
        assert_eq!(config.policy_group, constants::DEFAULT_POLICY_GROUP);
        assert!(!config.testing_mode);
    }

    #[test]
    fn testing_config_shortens_intervals() {
        let config = ShimConfig::for_testing("test-cluster");
        assert!(config.testing_mode);
        assert!(config.scheduling_interval < Duration::from_secs(1));
        assert_eq!(config.cluster_id, "test-cluster");
    }
}
