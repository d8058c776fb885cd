//! End-to-end harness: a mock cluster wiring real shim components against
//! mock scheduler-core and orchestrator peers. Only the remote edges are
//! fake; every internal code path is real.

use std::sync::Arc;
use std::time::Duration;

use berth_shim::api::Pod;
use berth_shim::appmgmt::AppManagementService;
use berth_shim::cache::{Application, ApplicationMetadata, Context, Task};
use berth_shim::client::ApiProvider;
use berth_shim::core::callback::RmCallback;
use berth_shim::dispatcher::Dispatcher;
use berth_shim::shim::ShimScheduler;
use berth_shim::state_machine::{ApplicationState, TaskState};
use berth_shim::test_utils::{
    node_for_test, MockOrchestratorClient, MockSchedulerApi, MockVolumeBinder,
};
use berth_shim::ShimConfig;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MockShim {
    pub config: Arc<ShimConfig>,
    pub core: Arc<MockSchedulerApi>,
    pub client: Arc<MockOrchestratorClient>,
    pub binder: Arc<MockVolumeBinder>,
    pub dispatcher: Arc<Dispatcher>,
    pub context: Arc<Context>,
    pub appmgmt: Arc<AppManagementService>,
    pub shim: Arc<ShimScheduler>,
}

impl MockShim {
    pub fn new(cluster_id: &str) -> Self {
        let config = Arc::new(ShimConfig::for_testing(cluster_id));
        let core = Arc::new(MockSchedulerApi::new());
        let client = Arc::new(MockOrchestratorClient::new());
        let binder = Arc::new(MockVolumeBinder::new());
        let api = Arc::new(ApiProvider::new(
            client.clone(),
            Some(binder.clone()),
            config.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher_capacity,
            config.drain_timeout,
        ));
        let context = Context::new(api.clone(), core.clone(), dispatcher.clone(), config.clone());
        core.set_callback(Arc::new(RmCallback::new(context.clone(), dispatcher.clone())));
        let appmgmt = AppManagementService::new(context.clone(), api.clone());
        let shim = ShimScheduler::new(
            context.clone(),
            appmgmt.clone(),
            dispatcher.clone(),
            core.clone(),
            config.clone(),
        );

        Self {
            config,
            core,
            client,
            binder,
            dispatcher,
            context,
            appmgmt,
            shim,
        }
    }

    pub async fn start(&self) {
        self.shim.start().await.expect("shim failed to start");
    }

    pub async fn add_node(&self, name: &str, cpu_milli: i64, memory_mi: i64) {
        self.context
            .add_node(&node_for_test(name, cpu_milli, memory_mi))
            .await;
    }

    pub fn submit_app(&self, application_id: &str, queue: &str, user: &str) -> Arc<Application> {
        self.context.add_application(
            ApplicationMetadata {
                application_id: application_id.to_string(),
                queue: queue.to_string(),
                user: user.to_string(),
                tags: Default::default(),
            },
            false,
        )
    }

    pub fn add_task(&self, application_id: &str, pod: Pod) -> Arc<Task> {
        self.context.add_pod_to_cache(&pod);
        let task_id = pod.uid.clone();
        self.context
            .add_task(application_id, &task_id, pod, false)
            .expect("failed to add task")
    }

    pub async fn wait_for_app_state(&self, application_id: &str, expected: ApplicationState) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(app) = self.context.get_application(application_id) {
                let current = app.state().await;
                if current == expected {
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!(
                        "application {application_id} did not reach {expected} in time, \
                         current state {current}"
                    );
                }
            } else if tokio::time::Instant::now() >= deadline {
                panic!("application {application_id} never appeared");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_for_task_state(
        &self,
        application_id: &str,
        task_id: &str,
        expected: TaskState,
    ) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Ok(task) = self.context.get_task(application_id, task_id) {
                let current = task.state().await;
                if current == expected {
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!(
                        "task {task_id} did not reach {expected} in time, current state {current}"
                    );
                }
            } else if tokio::time::Instant::now() >= deadline {
                panic!("task {task_id} never appeared");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Let queued events and mock responses settle.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}
