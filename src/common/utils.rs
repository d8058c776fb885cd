//! Pod inspection helpers: application-id and queue extraction,
//! schedulability checks.

use crate::api::Pod;
use crate::config::ShimConfig;
use crate::constants::{labels, DEFAULT_QUEUE};
use crate::error::{Result, ShimError};

/// Extract the application id from a pod.
///
/// The configured key is consulted first, then the Spark operator's label,
/// in labels before annotations. A pod without an application id is not
/// schedulable by this shim.
pub fn get_application_id(pod: &Pod, config: &ShimConfig) -> Result<String> {
    let keys = [config.app_id_label.as_str(), labels::SPARK_APPLICATION_ID];
    for key in keys {
        if let Some(value) = pod.label(key).or_else(|| pod.annotation(key)) {
            if !value.is_empty() {
                return Ok(value.to_string());
            }
        }
    }
    Err(ShimError::permanent(format!(
        "unable to retrieve application id from pod {}, no {} label or annotation",
        pod.name, config.app_id_label
    )))
}

/// Queue the pod asks for, defaulting when the label is absent.
pub fn get_queue_name(pod: &Pod) -> String {
    pod.label(labels::QUEUE_NAME)
        .filter(|q| !q.is_empty())
        .unwrap_or(DEFAULT_QUEUE)
        .to_string()
}

/// Only pods that explicitly request this shim's scheduler name and carry an
/// application id are scheduling targets; everything else is ignored
/// silently.
pub fn is_schedulable_pod(pod: &Pod, config: &ShimConfig) -> bool {
    pod.scheduler_name == config.scheduler_name && get_application_id(pod, config).is_ok()
}

/// Validation with a descriptive error, used where silence is not wanted.
pub fn validate_pod(pod: &Pod, config: &ShimConfig) -> Result<()> {
    if pod.scheduler_name != config.scheduler_name {
        return Err(ShimError::permanent(format!(
            "only pods requesting schedulerName={} are valid scheduling targets, \
             pod {}({}) requests {}",
            config.scheduler_name, pod.name, pod.uid, pod.scheduler_name
        )));
    }
    get_application_id(pod, config).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::PodBuilder;

    #[test]
    fn application_id_prefers_configured_label() {
        let config = ShimConfig::default();
        let pod = PodBuilder::new("p1")
            .label(labels::APPLICATION_ID, "app-1")
            .label(labels::SPARK_APPLICATION_ID, "spark-1")
            .build();
        assert_eq!(get_application_id(&pod, &config).unwrap(), "app-1");
    }

    #[test]
    fn application_id_falls_back_to_spark_label_and_annotations() {
        let config = ShimConfig::default();
        let pod = PodBuilder::new("p1")
            .label(labels::SPARK_APPLICATION_ID, "spark-1")
            .build();
        assert_eq!(get_application_id(&pod, &config).unwrap(), "spark-1");

        let pod = PodBuilder::new("p2")
            .annotation(labels::APPLICATION_ID, "app-2")
            .build();
        assert_eq!(get_application_id(&pod, &config).unwrap(), "app-2");
    }

    #[test]
    fn pod_without_app_id_is_not_schedulable() {
        let config = ShimConfig::default();
        let pod = PodBuilder::new("p1").build();
        assert!(get_application_id(&pod, &config).is_err());
        assert!(!is_schedulable_pod(&pod, &config));
    }

    #[test]
    fn scheduler_name_must_match() {
        let config = ShimConfig::default();
        let pod = PodBuilder::new("p1")
            .scheduler_name("other-scheduler")
            .app_id("app-1")
            .build();
        assert!(!is_schedulable_pod(&pod, &config));
        assert!(validate_pod(&pod, &config).is_err());
    }

    #[test]
    fn queue_name_defaults() {
        let pod = PodBuilder::new("p1").build();
        assert_eq!(get_queue_name(&pod), DEFAULT_QUEUE);

        let pod = PodBuilder::new("p2").queue("root.sandbox").build();
        assert_eq!(get_queue_name(&pod), "root.sandbox");
    }
}
