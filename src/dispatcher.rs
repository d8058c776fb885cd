//! # Event Dispatcher
//!
//! Process-wide asynchronous event bus. Events of each kind land on their
//! own bounded queue; a single consumer task per kind delivers them to the
//! handler registered at startup, in FIFO order. Ordering across kinds is
//! not promised.
//!
//! `dispatch` never blocks: a full queue yields
//! [`DispatchError::Backpressure`], leaving the caller to drop idempotent
//! events (the next tick re-emits them) or re-queue non-idempotent ones.
//!
//! The dispatcher is handed around as an `Arc` rather than living in a
//! global, so tests can run isolated instances side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::events::{ApplicationEvent, Event, NodeEvent, SchedulerEvent, TaskEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The queue for this event kind is full.
    #[error("dispatcher queue for {kind} events is full")]
    Backpressure { kind: &'static str },
    /// The dispatcher has been stopped.
    #[error("dispatcher is stopped")]
    Stopped,
}

/// Consumer seam: one handler per event kind, registered at startup.
#[async_trait]
pub trait EventHandler<E: Send + 'static>: Send + Sync {
    async fn handle_event(&self, event: E);
}

/// The handler set wired in at startup.
#[derive(Clone)]
pub struct Handlers {
    pub application: Arc<dyn EventHandler<ApplicationEvent>>,
    pub task: Arc<dyn EventHandler<TaskEvent>>,
    pub node: Arc<dyn EventHandler<NodeEvent>>,
    pub scheduler: Arc<dyn EventHandler<SchedulerEvent>>,
}

struct Receivers {
    application: mpsc::Receiver<ApplicationEvent>,
    task: mpsc::Receiver<TaskEvent>,
    node: mpsc::Receiver<NodeEvent>,
    scheduler: mpsc::Receiver<SchedulerEvent>,
}

pub struct Dispatcher {
    application_tx: mpsc::Sender<ApplicationEvent>,
    task_tx: mpsc::Sender<TaskEvent>,
    node_tx: mpsc::Sender<NodeEvent>,
    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    // Taken once by start().
    receivers: Mutex<Option<Receivers>>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    drain_timeout: Duration,
}

impl Dispatcher {
    pub fn new(capacity: usize, drain_timeout: Duration) -> Self {
        let (application_tx, application_rx) = mpsc::channel(capacity);
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (node_tx, node_rx) = mpsc::channel(capacity);
        let (scheduler_tx, scheduler_rx) = mpsc::channel(capacity);
        let (stop_tx, _) = watch::channel(false);

        Self {
            application_tx,
            task_tx,
            node_tx,
            scheduler_tx,
            receivers: Mutex::new(Some(Receivers {
                application: application_rx,
                task: task_rx,
                node: node_rx,
                scheduler: scheduler_rx,
            })),
            stop_tx,
            started: AtomicBool::new(false),
            drain_timeout,
        }
    }

    /// Enqueue an event without blocking.
    pub fn dispatch(&self, event: impl Into<Event>) -> Result<(), DispatchError> {
        fn classify<E>(
            kind: &'static str,
            result: Result<(), mpsc::error::TrySendError<E>>,
        ) -> Result<(), DispatchError> {
            match result {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Err(DispatchError::Backpressure { kind })
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Stopped),
            }
        }

        let event = event.into();
        let kind = event.kind();
        match event {
            Event::Application(ev) => classify(kind, self.application_tx.try_send(ev)),
            Event::Task(ev) => classify(kind, self.task_tx.try_send(ev)),
            Event::Node(ev) => classify(kind, self.node_tx.try_send(ev)),
            Event::Scheduler(ev) => classify(kind, self.scheduler_tx.try_send(ev)),
        }
    }

    /// Start the four consumer tasks. May be called once.
    pub async fn start(&self, handlers: Handlers) -> crate::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(crate::ShimError::Fatal(
                "dispatcher already started".to_string(),
            ));
        }
        let receivers = self
            .receivers
            .lock()
            .await
            .take()
            .ok_or_else(|| crate::ShimError::Fatal("dispatcher receivers gone".to_string()))?;

        info!("starting dispatcher consumers");
        spawn_consumer(
            "application",
            receivers.application,
            handlers.application,
            self.stop_tx.subscribe(),
            self.drain_timeout,
        );
        spawn_consumer(
            "task",
            receivers.task,
            handlers.task,
            self.stop_tx.subscribe(),
            self.drain_timeout,
        );
        spawn_consumer(
            "node",
            receivers.node,
            handlers.node,
            self.stop_tx.subscribe(),
            self.drain_timeout,
        );
        spawn_consumer(
            "scheduler",
            receivers.scheduler,
            handlers.scheduler,
            self.stop_tx.subscribe(),
            self.drain_timeout,
        );
        Ok(())
    }

    /// Signal consumers to drain their queues and exit.
    pub fn stop(&self) {
        info!("stopping dispatcher");
        let _ = self.stop_tx.send(true);
    }
}

fn spawn_consumer<E: Send + std::fmt::Debug + 'static>(
    kind: &'static str,
    mut rx: mpsc::Receiver<E>,
    handler: Arc<dyn EventHandler<E>>,
    mut stop_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => handler.handle_event(event).await,
                    None => break,
                },
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        drain(kind, &mut rx, handler.as_ref(), drain_timeout).await;
                        break;
                    }
                }
            }
        }
        debug!(kind, "dispatcher consumer exited");
    });
}

/// Deliver whatever is already queued, up to a deadline, then discard.
async fn drain<E: Send + std::fmt::Debug + 'static>(
    kind: &'static str,
    rx: &mut mpsc::Receiver<E>,
    handler: &dyn EventHandler<E>,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut discarded = 0usize;
    loop {
        match rx.try_recv() {
            Ok(event) => {
                if tokio::time::Instant::now() < deadline {
                    handler.handle_event(event).await;
                } else {
                    discarded += 1;
                }
            }
            Err(_) => break,
        }
    }
    if discarded > 0 {
        warn!(kind, discarded, "drain deadline hit, discarding queued events");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ApplicationVerb, NodeVerb, SchedulerVerb, TaskVerb};
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        seen: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventHandler<ApplicationEvent> for Recorder {
        async fn handle_event(&self, event: ApplicationEvent) {
            self.seen.lock().unwrap().push(event.application_id);
        }
    }

    #[async_trait]
    impl EventHandler<TaskEvent> for Recorder {
        async fn handle_event(&self, event: TaskEvent) {
            self.seen.lock().unwrap().push(event.task_id);
        }
    }

    #[async_trait]
    impl EventHandler<NodeEvent> for Recorder {
        async fn handle_event(&self, event: NodeEvent) {
            self.seen.lock().unwrap().push(event.node_id);
        }
    }

    #[async_trait]
    impl EventHandler<SchedulerEvent> for Recorder {
        async fn handle_event(&self, event: SchedulerEvent) {
            self.seen.lock().unwrap().push(event.verb.to_string());
        }
    }

    fn handlers(recorder: &Arc<Recorder>) -> Handlers {
        Handlers {
            application: recorder.clone(),
            task: recorder.clone(),
            node: recorder.clone(),
            scheduler: recorder.clone(),
        }
    }

    #[tokio::test]
    async fn per_kind_ordering_is_fifo() {
        let dispatcher = Dispatcher::new(64, Duration::from_millis(100));
        let recorder = Recorder::new();
        dispatcher.start(handlers(&recorder)).await.unwrap();

        for i in 0..20 {
            dispatcher
                .dispatch(ApplicationEvent::simple(
                    format!("app-{i:02}"),
                    ApplicationVerb::Run,
                ))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = recorder.seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..20).map(|i| format!("app-{i:02}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let dispatcher = Dispatcher::new(2, Duration::from_millis(100));
        // Not started: nothing consumes, so the third dispatch must fail.
        dispatcher
            .dispatch(NodeEvent::new("n1", NodeVerb::Recover))
            .unwrap();
        dispatcher
            .dispatch(NodeEvent::new("n2", NodeVerb::Recover))
            .unwrap();
        let err = dispatcher
            .dispatch(NodeEvent::new("n3", NodeVerb::Recover))
            .unwrap_err();
        assert_eq!(err, DispatchError::Backpressure { kind: "node" });
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let dispatcher = Dispatcher::new(8, Duration::from_millis(100));
        let recorder = Recorder::new();
        dispatcher.start(handlers(&recorder)).await.unwrap();
        assert!(dispatcher.start(handlers(&recorder)).await.is_err());
    }

    #[tokio::test]
    async fn stop_drains_queued_events() {
        let dispatcher = Dispatcher::new(64, Duration::from_secs(1));
        let recorder = Recorder::new();

        for _ in 0..5 {
            dispatcher
                .dispatch(SchedulerEvent::new(SchedulerVerb::Register))
                .unwrap();
        }
        dispatcher.start(handlers(&recorder)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn kinds_do_not_block_each_other() {
        let dispatcher = Dispatcher::new(64, Duration::from_millis(100));
        let recorder = Recorder::new();
        dispatcher.start(handlers(&recorder)).await.unwrap();

        dispatcher
            .dispatch(TaskEvent::simple("app-1", "t1", TaskVerb::Init))
            .unwrap();
        dispatcher
            .dispatch(NodeEvent::new("n1", NodeVerb::Recover))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
    }
}
