//! End-to-end scheduling scenarios against mock scheduler-core and
//! orchestrator peers.

mod common;

use berth_shim::api::{PodPhase, WatchEvent};
use berth_shim::constants::labels;
use berth_shim::core::types::{NodeAction, ReleaseReason};
use berth_shim::events::{ApplicationEvent, ApplicationVerb};
use berth_shim::state_machine::{ApplicationState, NodeState, TaskState};
use berth_shim::test_utils::{node_for_test, MockFailure, PodBuilder};

use common::MockShim;

/// S1: a single task goes all the way from submission to a bound pod.
#[tokio::test]
async fn happy_path_single_task() {
    let cluster = MockShim::new("test-cluster-s1");
    cluster.core.plan_allocation("t1", "n1");
    cluster.start().await;

    cluster.add_node("n1", 4000, 8192).await;
    cluster.submit_app("app-01", "root.default", "alice");
    let pod = PodBuilder::new("t1")
        .app_id("app-01")
        .queue("root.default")
        .cpu_milli(1000)
        .memory_mi(1024)
        .build();
    cluster.add_task("app-01", pod);

    cluster
        .wait_for_app_state("app-01", ApplicationState::Running)
        .await;
    cluster
        .wait_for_task_state("app-01", "t1", TaskState::Bound)
        .await;

    let binds = cluster.client.binds();
    assert_eq!(binds, vec![("t1".to_string(), "n1".to_string())]);

    // Allocation conservation: bound tasks match the core's live UUIDs.
    let outstanding = cluster.core.outstanding_allocations("app-01");
    assert_eq!(outstanding.len(), 1);
    let task = cluster.context.get_task("app-01", "t1").unwrap();
    assert_eq!(task.allocation_uuid().await, Some(outstanding[0].clone()));
    assert_eq!(task.node_name().await.as_deref(), Some("n1"));
}

/// S2: a rejected application lands in Failed without any allocation
/// traffic.
#[tokio::test]
async fn rejection_path() {
    let cluster = MockShim::new("test-cluster-s2");
    cluster.core.reject_application("app-02");
    cluster.start().await;

    cluster.submit_app("app-02", "root.unknown", "bob");
    cluster
        .wait_for_app_state("app-02", ApplicationState::Failed)
        .await;

    let app = cluster.context.get_application("app-02").unwrap();
    let failure = app.failure().await.expect("failed app carries a record");
    assert!(failure.reason.contains("unknown queue"));

    assert!(cluster.core.asks().is_empty());
    assert!(cluster.core.releases().is_empty());
}

/// S3: cordoning a node drains it; its bound task stays bound.
#[tokio::test]
async fn cordon_drains_node() {
    let cluster = MockShim::new("test-cluster-s3");
    cluster.core.plan_allocation("t1", "n1");
    cluster.start().await;

    cluster.add_node("n1", 4000, 8192).await;
    cluster.submit_app("app-03", "root.default", "alice");
    let pod = PodBuilder::new("t1")
        .app_id("app-03")
        .cpu_milli(1000)
        .memory_mi(1024)
        .build();
    cluster.add_task("app-03", pod);
    cluster
        .wait_for_task_state("app-03", "t1", TaskState::Bound)
        .await;

    let node = cluster.context.nodes().get_node("n1").unwrap();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while node.state().await != NodeState::Healthy {
        assert!(
            tokio::time::Instant::now() < deadline,
            "node never became healthy"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let healthy = node_for_test("n1", 4000, 8192);
    let mut cordoned = healthy.clone();
    cordoned.unschedulable = true;
    cluster.context.update_node(&healthy, &cordoned).await;
    cluster.settle().await;

    let node = cluster.context.nodes().get_node("n1").unwrap();
    assert_eq!(node.state().await, NodeState::Draining);

    let drain_reports: Vec<_> = cluster
        .core
        .updates()
        .into_iter()
        .flat_map(|u| u.updated_nodes)
        .filter(|n| n.node_id == "n1" && n.action == NodeAction::Drain)
        .collect();
    assert_eq!(drain_reports.len(), 1);
    assert!(!drain_reports[0].schedulable);

    // The drained node keeps its allocation.
    let task = cluster.context.get_task("app-03", "t1").unwrap();
    assert_eq!(task.state().await, TaskState::Bound);
}

/// S4: a volume-binding failure rolls the task back: forget the assumed
/// pod and release the allocation.
#[tokio::test]
async fn bind_failure_rolls_back() {
    let cluster = MockShim::new("test-cluster-s4");
    cluster.core.plan_allocation("t2", "n1");
    cluster
        .binder
        .set_bind_failure(Some(MockFailure::permanent("volume attach refused")));
    cluster.start().await;

    cluster.add_node("n1", 4000, 8192).await;
    cluster.submit_app("app-04", "root.default", "alice");
    let pod = PodBuilder::new("t2")
        .app_id("app-04")
        .cpu_milli(500)
        .memory_mi(512)
        .build();
    cluster.add_task("app-04", pod);

    cluster
        .wait_for_task_state("app-04", "t2", TaskState::Failed)
        .await;
    cluster.settle().await;

    // ForgetPod ran: the assumption is gone from the orchestrator cache.
    assert!(!cluster.context.cache().is_assumed("t2"));
    // The orchestrator bind API was never reached.
    assert!(cluster.client.binds().is_empty());

    let releases = cluster.core.releases();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].application_id, "app-04");
    assert_eq!(releases[0].reason, ReleaseReason::Stopped);

    // Conservation: nothing outstanding after the rollback.
    assert!(cluster.core.outstanding_allocations("app-04").is_empty());
}

/// S5: startup recovery rebuilds applications, tasks, and node allocations
/// from pre-existing orchestrator state.
#[tokio::test]
async fn recovery_rebuilds_cluster_state() {
    let cluster = MockShim::new("test-cluster-s5");
    cluster.core.hold_accepts(true);

    cluster.client.seed_node(node_for_test("n1", 4000, 8192));
    let bound_pod = PodBuilder::new("t3")
        .app_id("app-03")
        .node("n1")
        .phase(PodPhase::Running)
        .cpu_milli(500)
        .memory_mi(512)
        .build();
    cluster.client.seed_pod(bound_pod);

    cluster.start().await;

    let app = cluster
        .context
        .get_application("app-03")
        .expect("recovered application exists");
    assert_eq!(app.state().await, ApplicationState::Recovering);

    let task = cluster.context.get_task("app-03", "t3").unwrap();
    assert_eq!(task.state().await, TaskState::Allocated);
    assert_eq!(task.node_name().await.as_deref(), Some("n1"));

    let new_nodes: Vec<_> = cluster
        .core
        .updates()
        .into_iter()
        .flat_map(|u| u.new_nodes)
        .collect();
    assert_eq!(new_nodes.len(), 1);
    assert_eq!(new_nodes[0].node_id, "n1");
    assert_eq!(new_nodes[0].existing_allocations.len(), 1);
    assert_eq!(new_nodes[0].existing_allocations[0].uuid, "t3");
}

/// Recovery is idempotent: a second pass over the same orchestrator
/// snapshot changes nothing.
#[tokio::test]
async fn recovery_is_idempotent() {
    let cluster = MockShim::new("test-cluster-recovery-idem");
    cluster.client.seed_node(node_for_test("n1", 4000, 8192));
    let bound_pod = PodBuilder::new("t9")
        .app_id("app-09")
        .node("n1")
        .phase(PodPhase::Running)
        .cpu_milli(500)
        .memory_mi(512)
        .build();
    cluster.client.seed_pod(bound_pod.clone());
    cluster.start().await;

    let app_before = cluster.context.get_application("app-09").unwrap();
    let task_before = cluster.context.get_task("app-09", "t9").unwrap();

    // Run the recovery lineage again by hand.
    let app_again = cluster.appmgmt.recover_application(&bound_pod).unwrap();

    assert!(std::sync::Arc::ptr_eq(&app_before, &app_again));
    assert_eq!(app_again.task_count(), 1);
    let task_after = cluster.context.get_task("app-09", "t9").unwrap();
    assert!(std::sync::Arc::ptr_eq(&task_before, &task_after));
    assert_eq!(task_after.state().await, TaskState::Allocated);
    assert_eq!(cluster.context.nodes().node_names(), vec!["n1".to_string()]);
}

/// S6: the Spark completion handler completes the application when the
/// driver pod succeeds.
#[tokio::test]
async fn spark_driver_completion() {
    let cluster = MockShim::new("test-cluster-s6");
    cluster.start().await;

    cluster.submit_app("app-04", "root.default", "alice");
    cluster
        .wait_for_app_state("app-04", ApplicationState::Running)
        .await;

    let driver = PodBuilder::new("driver-pod")
        .uid("driver-uid")
        .app_id("app-04")
        .label(labels::SPARK_ROLE, labels::SPARK_ROLE_DRIVER)
        .build();
    cluster.appmgmt.delete_pod(&driver).await;

    // The watcher registers asynchronously; wait for it before emitting.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while cluster.client.watcher_count() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "completion watch never started"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let succeeded = PodBuilder::new("driver-pod")
        .uid("driver-uid")
        .app_id("app-04")
        .label(labels::SPARK_ROLE, labels::SPARK_ROLE_DRIVER)
        .phase(PodPhase::Succeeded)
        .build();
    cluster
        .client
        .push_watch_event("default", WatchEvent::Modified(succeeded))
        .await;

    cluster
        .wait_for_app_state("app-04", ApplicationState::Completed)
        .await;
}

/// The watch stream closing before success is "no completion observed":
/// the handler exits silently and the application keeps running.
#[tokio::test]
async fn completion_watch_closing_is_silent() {
    let cluster = MockShim::new("test-cluster-watch-close");
    cluster.start().await;

    cluster.submit_app("app-05", "root.default", "alice");
    cluster
        .wait_for_app_state("app-05", ApplicationState::Running)
        .await;

    let driver = PodBuilder::new("driver-2")
        .uid("driver-2-uid")
        .app_id("app-05")
        .label(labels::SPARK_ROLE, labels::SPARK_ROLE_DRIVER)
        .build();
    cluster.appmgmt.delete_pod(&driver).await;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while cluster.client.watcher_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    cluster.client.close_watches();
    cluster.settle().await;

    let app = cluster.context.get_application("app-05").unwrap();
    assert_eq!(app.state().await, ApplicationState::Running);
}

/// Per-entity serialization: concurrent dispatchers hammering one
/// application leave it in a state some serial execution would produce,
/// with invalid interleavings dropped rather than corrupting anything.
#[tokio::test]
async fn concurrent_events_serialize_per_entity() {
    let cluster = MockShim::new("test-cluster-serialize");
    cluster.start().await;

    cluster.submit_app("app-06", "root.default", "carol");
    cluster
        .wait_for_app_state("app-06", ApplicationState::Running)
        .await;

    let mut producers = Vec::new();
    for _ in 0..4 {
        let dispatcher = cluster.dispatcher.clone();
        producers.push(tokio::spawn(async move {
            for _ in 0..25 {
                // Run is valid (idempotent re-entry); Accept is not from
                // Running and must be dropped harmlessly.
                let _ = dispatcher.dispatch(ApplicationEvent::simple(
                    "app-06",
                    ApplicationVerb::Run,
                ));
                let _ = dispatcher.dispatch(ApplicationEvent::simple(
                    "app-06",
                    ApplicationVerb::Accept,
                ));
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    cluster.settle().await;

    let app = cluster.context.get_application("app-06").unwrap();
    assert_eq!(app.state().await, ApplicationState::Running);
}

/// A failed watch must not wedge the completion gate: a later driver
/// delete gets to start a fresh handler that can still complete the app.
#[tokio::test]
async fn completion_handler_restarts_after_watch_failure() {
    let cluster = MockShim::new("test-cluster-watch-retry");
    cluster.start().await;

    cluster.submit_app("app-08", "root.default", "alice");
    cluster
        .wait_for_app_state("app-08", ApplicationState::Running)
        .await;

    let driver = PodBuilder::new("driver-3")
        .uid("driver-3-uid")
        .app_id("app-08")
        .label(labels::SPARK_ROLE, labels::SPARK_ROLE_DRIVER)
        .build();

    cluster
        .client
        .set_watch_failure(Some(MockFailure::transient("api server unavailable")));
    cluster.appmgmt.delete_pod(&driver).await;
    cluster.settle().await;
    assert_eq!(cluster.client.watcher_count(), 0);

    cluster.client.set_watch_failure(None);
    cluster.appmgmt.delete_pod(&driver).await;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while cluster.client.watcher_count() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "completion handler did not restart after watch failure"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let succeeded = PodBuilder::new("driver-3")
        .uid("driver-3-uid")
        .app_id("app-08")
        .label(labels::SPARK_ROLE, labels::SPARK_ROLE_DRIVER)
        .phase(PodPhase::Succeeded)
        .build();
    cluster
        .client
        .push_watch_event("default", WatchEvent::Modified(succeeded))
        .await;

    cluster
        .wait_for_app_state("app-08", ApplicationState::Completed)
        .await;
}

/// Lock discipline holds under pressure: registry reads, task additions,
/// and event handling running concurrently all finish without deadlocking.
#[tokio::test]
async fn concurrent_context_access_does_not_deadlock() {
    let cluster = MockShim::new("test-cluster-locks");
    for i in 0..16 {
        cluster.core.plan_allocation(&format!("lt{i}"), "n1");
    }
    cluster.start().await;
    cluster.add_node("n1", 64000, 65536).await;
    cluster.submit_app("app-07", "root.default", "dave");
    cluster
        .wait_for_app_state("app-07", ApplicationState::Running)
        .await;

    let mut workers = Vec::new();
    for i in 0..16 {
        let context = cluster.context.clone();
        workers.push(tokio::spawn(async move {
            let pod = PodBuilder::new(&format!("lt{i}"))
                .app_id("app-07")
                .cpu_milli(100)
                .memory_mi(64)
                .build();
            context.add_pod_to_cache(&pod);
            context
                .add_task("app-07", &format!("lt{i}"), pod, false)
                .unwrap();
        }));
    }
    for _ in 0..8 {
        let context = cluster.context.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let apps = context.select_applications(|_| true);
                for app in apps {
                    let _ = app.state().await;
                    for task in app.tasks() {
                        let _ = task.state().await;
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    let all = async {
        for worker in workers {
            worker.await.unwrap();
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), all)
        .await
        .expect("concurrent access deadlocked");

    // Everything still schedules to completion afterwards.
    for i in 0..16 {
        cluster
            .wait_for_task_state("app-07", &format!("lt{i}"), TaskState::Bound)
            .await;
    }
    assert_eq!(
        cluster.core.outstanding_allocations("app-07").len(),
        16
    );
}

/// ConfigMap add/update trigger a scheduler-core reload; delete does not.
#[tokio::test]
async fn config_map_changes_trigger_reload() {
    let cluster = MockShim::new("test-cluster-reload");
    cluster.start().await;

    let config_map = berth_shim::api::ConfigMap {
        name: berth_shim::constants::DEFAULT_CONFIG_MAP_NAME.to_string(),
        data: Default::default(),
    };
    assert!(cluster.context.filter_config_maps(&config_map));

    cluster.context.add_config_map(&config_map).await;
    cluster.context.update_config_map(&config_map).await;
    cluster.context.delete_config_map(&config_map);

    let reloads = cluster.core.reloads();
    assert_eq!(reloads.len(), 2);
    assert!(reloads.iter().all(|c| c == "test-cluster-reload"));

    let other = berth_shim::api::ConfigMap {
        name: "unrelated".to_string(),
        data: Default::default(),
    };
    assert!(!cluster.context.filter_config_maps(&other));
}

/// Registration retries transient scheduler-core failures before the shim
/// comes up.
#[tokio::test]
async fn registration_retries_transient_failures() {
    let cluster = MockShim::new("test-cluster-register-retry");
    cluster.core.fail_registrations(2);
    cluster.start().await;

    assert!(cluster.core.registrations().len() >= 3);
    assert_eq!(
        cluster.shim.state().await,
        berth_shim::state_machine::SchedulerState::Running
    );
}
