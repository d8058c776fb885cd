//! # System Constants
//!
//! Label and annotation keys, default names, and operational bounds shared
//! across the shim. Resource names follow the orchestrator's conventions
//! (cpu in millicores, memory in bytes).

/// Pod label/annotation keys the shim recognizes.
pub mod labels {
    /// Primary application-id label. Can be overridden through configuration.
    pub const APPLICATION_ID: &str = "applicationId";
    /// Fallback application-id label written by the Spark operator.
    pub const SPARK_APPLICATION_ID: &str = "spark-app-selector";
    /// Queue-name label on workload pods.
    pub const QUEUE_NAME: &str = "queue";
    /// Spark role label.
    pub const SPARK_ROLE: &str = "spark-role";
    /// Spark driver role value.
    pub const SPARK_ROLE_DRIVER: &str = "driver";
}

/// Resource vector component names.
pub mod resources {
    /// CPU, measured in millicores.
    pub const CPU: &str = "cpu";
    /// Memory, measured in bytes.
    pub const MEMORY: &str = "memory";
}

/// Partition every application lands in unless tags say otherwise.
pub const DEFAULT_PARTITION: &str = "default";

/// Queue used when a pod carries no queue label.
pub const DEFAULT_QUEUE: &str = "root.default";

/// Namespace recorded in application tags when the pod has none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// ConfigMap name that triggers a scheduler-core configuration reload.
pub const DEFAULT_CONFIG_MAP_NAME: &str = "berth-configs";

/// Scheduler name pods must request to be handled by this shim.
pub const DEFAULT_SCHEDULER_NAME: &str = "berth";

/// Policy group announced to scheduler-core at registration.
pub const DEFAULT_POLICY_GROUP: &str = "queues";

/// Per-kind dispatcher queue capacity.
pub const DEFAULT_DISPATCHER_CAPACITY: usize = 10240;

/// Upper bound on concurrently running completion-handler watches.
pub const DEFAULT_MAX_COMPLETION_WATCHES: usize = 64;

/// How long the shim waits for recovering applications to be accepted.
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 30;

/// How long dispatcher consumers keep draining queued events at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;
