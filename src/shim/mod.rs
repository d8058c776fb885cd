//! # Shim Lifecycle
//!
//! Owns startup, recovery, steady-state scheduling, and shutdown. The
//! lifecycle is itself a state machine driven over the dispatcher:
//! registration chains into recovery, recovery into the running tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::appmgmt::AppManagementService;
use crate::cache::Context;
use crate::config::ShimConfig;
use crate::core::types::RegisterRequest;
use crate::core::SchedulerApi;
use crate::dispatcher::{Dispatcher, EventHandler, Handlers};
use crate::error::{Result, ShimError};
use crate::events::{SchedulerEvent, SchedulerVerb};
use crate::state_machine::{
    ApplicationState, SchedulerState, StateMachine, StateMachineError, Transition,
};

static SCHEDULER_TRANSITIONS: &[Transition<SchedulerState, SchedulerVerb>] = &[
    Transition {
        verb: SchedulerVerb::Register,
        from: &[SchedulerState::Created],
        to: SchedulerState::Registering,
    },
    Transition {
        verb: SchedulerVerb::Registered,
        from: &[SchedulerState::Registering],
        to: SchedulerState::Registered,
    },
    Transition {
        verb: SchedulerVerb::Recover,
        from: &[SchedulerState::Registered],
        to: SchedulerState::Recovering,
    },
    Transition {
        verb: SchedulerVerb::RecoverComplete,
        from: &[SchedulerState::Recovering],
        to: SchedulerState::Running,
    },
    Transition {
        verb: SchedulerVerb::Drain,
        from: &[SchedulerState::Running],
        to: SchedulerState::Draining,
    },
    Transition {
        verb: SchedulerVerb::Stop,
        from: &[SchedulerState::Draining],
        to: SchedulerState::Stopped,
    },
];

struct SchedulerInner {
    sm: StateMachine<SchedulerState, SchedulerVerb>,
}

pub struct ShimScheduler {
    inner: RwLock<SchedulerInner>,
    context: Arc<Context>,
    appmgmt: Arc<AppManagementService>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<dyn SchedulerApi>,
    config: Arc<ShimConfig>,
    stop_tx: watch::Sender<bool>,
}

impl ShimScheduler {
    pub fn new(
        context: Arc<Context>,
        appmgmt: Arc<AppManagementService>,
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<dyn SchedulerApi>,
        config: Arc<ShimConfig>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            inner: RwLock::new(SchedulerInner {
                sm: StateMachine::new(SchedulerState::Created, SCHEDULER_TRANSITIONS),
            }),
            context,
            appmgmt,
            dispatcher,
            scheduler,
            config,
            stop_tx,
        })
    }

    pub async fn state(&self) -> SchedulerState {
        self.inner.read().await.sm.current()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Wire the dispatcher and run the startup sequence: register with
    /// scheduler-core, recover pre-existing cluster state, then enter the
    /// running tick. Returns once the shim is Running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("🚀 starting scheduler shim");
        self.dispatcher
            .start(Handlers {
                application: self.context.clone(),
                task: self.context.clone(),
                node: self.context.clone(),
                scheduler: self.clone(),
            })
            .await?;

        self.dispatcher
            .dispatch(SchedulerEvent::new(SchedulerVerb::Register))?;

        let deadline = self.config.recovery_timeout + Duration::from_secs(30);
        self.wait_for_state(SchedulerState::Running, deadline).await
    }

    /// Drain and stop: completion handlers first, then the tick, then the
    /// dispatcher consumers.
    pub async fn stop(&self) {
        info!("🛑 stopping scheduler shim");
        if let Err(e) = self
            .dispatcher
            .dispatch(SchedulerEvent::new(SchedulerVerb::Drain))
        {
            warn!(error = %e, "failed to dispatch drain");
            return;
        }
        if self
            .wait_for_state(SchedulerState::Draining, Duration::from_secs(5))
            .await
            .is_err()
        {
            warn!("shim did not reach Draining in time");
        }
        if let Err(e) = self
            .dispatcher
            .dispatch(SchedulerEvent::new(SchedulerVerb::Stop))
        {
            warn!(error = %e, "failed to dispatch stop");
        }
        let _ = self
            .wait_for_state(SchedulerState::Stopped, Duration::from_secs(5))
            .await;
    }

    pub async fn wait_for_state(
        &self,
        expected: SchedulerState,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.state().await;
            if current == expected {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ShimError::Fatal(format!(
                    "shim did not reach state {expected} in time, current state {current}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn handle(&self, event: &SchedulerEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        debug!(
            state = %inner.sm.current(),
            verb = %event.verb,
            "scheduler state transition"
        );
        if !inner.sm.can(event.verb) {
            return Err(ShimError::InvalidTransition {
                entity: "scheduler",
                id: self.config.cluster_id.clone(),
                state: inner.sm.current().to_string(),
                verb: event.verb.to_string(),
            });
        }

        self.on_event(event).await?;

        match inner.sm.fire(event.verb) {
            Ok(_) | Err(StateMachineError::NoTransition) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn on_event(&self, event: &SchedulerEvent) -> Result<()> {
        match event.verb {
            SchedulerVerb::Register => self.on_register().await,
            SchedulerVerb::Registered => {
                self.dispatcher
                    .dispatch(SchedulerEvent::new(SchedulerVerb::Recover))?;
                Ok(())
            }
            SchedulerVerb::Recover => self.on_recover().await,
            SchedulerVerb::RecoverComplete => {
                self.spawn_scheduling_tick();
                Ok(())
            }
            SchedulerVerb::Drain => {
                self.appmgmt.stop();
                let _ = self.stop_tx.send(true);
                Ok(())
            }
            SchedulerVerb::Stop => {
                self.dispatcher.stop();
                Ok(())
            }
        }
    }

    /// Register with scheduler-core, retrying transient failures with
    /// backoff until shutdown.
    async fn on_register(&self) -> Result<()> {
        let request = RegisterRequest {
            rm_id: self.config.cluster_id.clone(),
            version: self.config.cluster_version.clone(),
            policy_group: self.config.policy_group.clone(),
        };
        info!(cluster_id = %request.rm_id, "registering with scheduler-core");

        let mut backoff = Duration::from_millis(250);
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            match self.scheduler.register(request.clone()).await {
                Ok(()) => {
                    self.dispatcher
                        .dispatch(SchedulerEvent::new(SchedulerVerb::Registered))?;
                    return Ok(());
                }
                Err(e) if e.is_retriable() => {
                    warn!(error = %e, delay_ms = backoff.as_millis() as u64, "registration failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop_rx.changed() => {
                            return Err(ShimError::Fatal("shutdown during registration".to_string()));
                        }
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                Err(e) => {
                    error!(error = %e, "registration rejected by scheduler-core");
                    return Err(ShimError::Fatal(format!("registration failed: {e}")));
                }
            }
        }
    }

    /// Rebuild in-memory state from the orchestrator's current object set:
    /// nodes first, then every assigned pod becomes an existing allocation
    /// plus a recovered application/task pair. Node recovery reports are
    /// dispatched only after the allocations are registered so the NewNodes
    /// message carries them.
    async fn on_recover(&self) -> Result<()> {
        info!("recovering scheduler state from orchestrator");
        let client = self.context.api_provider().client().clone();

        let nodes = client.list_nodes().await.map_err(|e| {
            error!(error = %e, "unable to enumerate nodes for recovery");
            ShimError::Fatal(format!("recovery failed: {e}"))
        })?;
        for node in &nodes {
            self.context.cache().add_node(node);
            self.context.nodes().add_node_silently(node).await;
        }

        let pods = client.list_pods().await.map_err(|e| {
            error!(error = %e, "unable to enumerate pods for recovery");
            ShimError::Fatal(format!("recovery failed: {e}"))
        })?;
        for pod in &pods {
            if !self.context.filter_pods(pod) || !pod.is_assigned() {
                continue;
            }
            self.context.add_pod_to_cache(pod);
            match self.appmgmt.recover_application(pod) {
                Ok(app) => {
                    if let Err(e) = self
                        .context
                        .nodes()
                        .add_existing_allocation(pod, app.application_id())
                        .await
                    {
                        warn!(pod = %pod.name, error = %e, "failed to register existing allocation");
                    }
                }
                Err(e) => warn!(pod = %pod.name, error = %e, "failed to recover application"),
            }
        }

        for node in &nodes {
            self.context.nodes().dispatch_recover_if_new(&node.name).await;
        }

        self.wait_for_app_recovery().await;
        self.dispatcher
            .dispatch(SchedulerEvent::new(SchedulerVerb::RecoverComplete))?;
        Ok(())
    }

    /// Wait until every recovering application has been accepted, or give
    /// up after the recovery timeout; stragglers are re-submitted by the
    /// tick.
    async fn wait_for_app_recovery(&self) {
        let deadline = tokio::time::Instant::now() + self.config.recovery_timeout;
        loop {
            let mut pending = 0usize;
            for app in self.context.all_applications() {
                if matches!(
                    app.state().await,
                    ApplicationState::New | ApplicationState::Recovering
                ) {
                    pending += 1;
                }
            }
            if pending == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending, "recovery timeout hit, proceeding with stragglers");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// The periodic scheduling pass: every interval, each application gets
    /// a synchronous `schedule()` call.
    fn spawn_scheduling_tick(&self) {
        let context = self.context.clone();
        let interval = self.config.scheduling_interval;
        let mut stop_rx = self.stop_tx.subscribe();
        info!(interval_ms = interval.as_millis() as u64, "✅ shim running, starting scheduling tick");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for app in context.all_applications() {
                            app.schedule().await;
                        }
                    }
                    _ = stop_rx.changed() => {
                        debug!("scheduling tick stopped");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl EventHandler<SchedulerEvent> for ShimScheduler {
    async fn handle_event(&self, event: SchedulerEvent) {
        if let Err(e) = self.handle(&event).await {
            error!(verb = %event.verb, error = %e, "failed to handle scheduler event");
        }
    }
}
