//! Event Bus implementation

use crate::config::{DispatchMode, EventBusConfig};
use crate::dead_letter::DeadLetter;
use crate::event::DomainEvent;
use crate::handler::{EventHandler, EventHandlerError};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type HandlerList = Vec<Arc<dyn EventHandler>>;
type SharedReceiver = Arc<Mutex<mpsc::Receiver<DomainEvent>>>;

/// Lifecycle state of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Event bus statistics
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    /// Whether the bus accepts publishes
    pub is_running: bool,
    /// Lifecycle state
    pub state: BusState,
    /// Workers in the current pool (0 when not running)
    pub worker_count: usize,
    /// Worker tasks that have not exited yet
    pub active_workers: usize,
    /// Events waiting in the queue(s)
    pub queue_depth: usize,
    /// Total queue capacity
    pub queue_capacity: usize,
    /// Recorded dead letters
    pub dead_letter_count: usize,
    /// Event types with at least one handler, sorted
    pub registered_types: Vec<String>,
    /// Handlers across all event types
    pub total_handlers: usize,
    /// Events accepted by `publish`
    pub published: u64,
    /// Events taken off the queue and dispatched
    pub dispatched: u64,
    /// Failed handler invocations
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
    active_workers: AtomicUsize,
}

struct Runtime {
    state: BusState,
    senders: Vec<mpsc::Sender<DomainEvent>>,
    shutdown: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    fn new() -> Self {
        Self {
            state: BusState::NotStarted,
            senders: Vec::new(),
            shutdown: None,
            workers: Vec::new(),
        }
    }

    fn queue_depth(&self) -> usize {
        self.senders
            .iter()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .sum()
    }

    fn queue_capacity(&self) -> usize {
        self.senders.iter().map(|tx| tx.max_capacity()).sum()
    }
}

/// Event bus for asynchronous in-process fan-out.
///
/// A pool of worker tasks drains the dispatch queue and invokes every handler
/// subscribed to an event's type. Handler failures are isolated: they are
/// logged, recorded as [`DeadLetter`]s, and never reach the publisher.
///
/// Events still queued when [`stop`](EventBus::stop) is called are dropped.
#[derive(Clone)]
pub struct EventBus {
    /// Handlers registered for each event type
    handlers: Arc<DashMap<String, HandlerList>>,

    /// Failed invocations
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,

    /// Queues, workers and lifecycle state
    runtime: Arc<RwLock<Runtime>>,

    counters: Arc<Counters>,

    /// Configuration
    config: Arc<EventBusConfig>,
}

impl EventBus {
    /// Create new event bus
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create event bus with custom config
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            runtime: Arc::new(RwLock::new(Runtime::new())),
            counters: Arc::new(Counters::default()),
            config: Arc::new(config),
        }
    }

    /// Get the bus configuration
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Start the worker pool with the configured worker count
    pub async fn start(&self) -> Result<(), EventBusError> {
        self.start_with_workers(self.config.worker_count).await
    }

    /// Start the worker pool with `worker_count` workers
    ///
    /// A stopped bus may be started again; it gets fresh, empty queues.
    pub async fn start_with_workers(&self, worker_count: usize) -> Result<(), EventBusError> {
        let config = EventBusConfig {
            worker_count,
            ..(*self.config).clone()
        };
        config.validate()?;

        let mut runtime = self.runtime.write().await;
        match runtime.state {
            BusState::NotStarted | BusState::Stopped => {}
            state => return Err(EventBusError::AlreadyRunning(state)),
        }

        let (senders, receivers) = build_queues(&config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker = Worker {
                id,
                receiver: Arc::clone(&receivers[id % receivers.len()]),
                shutdown: shutdown_rx.clone(),
                handlers: self.handlers.clone(),
                dead_letters: self.dead_letters.clone(),
                counters: self.counters.clone(),
                poll_interval: config.poll_interval,
                handler_timeout: config.handler_timeout,
                log: config.enable_logging,
                _active: ActiveWorker::enter(self.counters.clone()),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        runtime.state = BusState::Running;
        runtime.senders = senders;
        runtime.shutdown = Some(shutdown_tx);
        runtime.workers = workers;

        if self.config.enable_logging {
            info!(
                workers = worker_count,
                queue_capacity = config.queue_capacity,
                dispatch_mode = ?config.dispatch_mode,
                "Event bus started"
            );
        }

        Ok(())
    }

    /// Stop the worker pool
    ///
    /// Workers finish the dispatch they are running and then exit. Workers that
    /// are still busy after the shutdown grace period are aborted and
    /// `ShutdownTimedOut` is returned; the bus is `Stopped` either way.
    /// Stopping a bus that is not running is a no-op.
    pub async fn stop(&self) -> Result<(), EventBusError> {
        let (shutdown, mut workers, backlog) = {
            let mut runtime = self.runtime.write().await;
            if runtime.state != BusState::Running {
                return Ok(());
            }
            runtime.state = BusState::Stopping;
            let backlog = runtime.queue_depth();
            runtime.senders.clear();
            (
                runtime.shutdown.take(),
                std::mem::take(&mut runtime.workers),
                backlog,
            )
        };

        if self.config.enable_logging {
            info!(workers = workers.len(), "Event bus stopping");
            if backlog > 0 {
                warn!(backlog, "Dropping undelivered events on shutdown");
            }
        }

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }

        let grace = self.config.shutdown_grace;
        let joined =
            tokio::time::timeout(grace, futures::future::join_all(workers.iter_mut())).await;

        let result = match joined {
            Ok(_) => Ok(()),
            Err(_) => {
                let stuck: Vec<JoinHandle<()>> =
                    workers.into_iter().filter(|h| !h.is_finished()).collect();
                let count = stuck.len();
                for handle in &stuck {
                    handle.abort();
                }
                let _ = futures::future::join_all(stuck).await;
                if self.config.enable_logging {
                    error!(workers = count, ?grace, "Aborted workers after shutdown grace period");
                }
                Err(EventBusError::ShutdownTimedOut(count))
            }
        };

        self.runtime.write().await.state = BusState::Stopped;

        if self.config.enable_logging {
            info!("Event bus stopped");
        }

        result
    }

    /// Current lifecycle state
    pub async fn state(&self) -> BusState {
        self.runtime.read().await.state
    }

    /// Whether the bus accepts publishes
    pub async fn is_running(&self) -> bool {
        self.state().await == BusState::Running
    }

    /// Subscribe a handler to an event type
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let bus = EventBus::new();
    /// bus.subscribe("order.created", Arc::new(ShippingHandler::new()));
    /// ```
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();

        if self.config.enable_logging {
            debug!(event_type = %event_type, handler = handler.name(), "Subscribed handler");
        }

        self.handlers.entry(event_type).or_default().push(handler);
    }

    /// Unsubscribe one handler from an event type
    ///
    /// Handlers are matched by identity. Returns whether a handler was removed.
    pub fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let removed = match self.handlers.get_mut(event_type) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|h| !std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(handler)));
                handlers.len() != before
            }
            None => false,
        };

        self.handlers.remove_if(event_type, |_, handlers| handlers.is_empty());

        if removed && self.config.enable_logging {
            debug!(event_type, handler = handler.name(), "Unsubscribed handler");
        }

        removed
    }

    /// Unsubscribe all handlers for an event type
    pub fn unsubscribe_all(&self, event_type: &str) {
        self.handlers.remove(event_type);

        if self.config.enable_logging {
            debug!(event_type, "Unsubscribed all handlers");
        }
    }

    /// Clear all handlers
    pub fn clear(&self) {
        self.handlers.clear();
        if self.config.enable_logging {
            info!("Cleared all event handlers");
        }
    }

    /// Get handler count for an event type
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map(|h| h.len()).unwrap_or(0)
    }

    /// Publish an event
    ///
    /// The event is queued for the worker pool. When the queue is full this
    /// waits for space. Stamps `published_at` into the event metadata.
    pub async fn publish(&self, event: DomainEvent) -> Result<(), EventBusError> {
        let (sender, event) = self.prepare(event).await?;

        if sender.send(event).await.is_err() {
            return Err(self.closed_error().await);
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Publish an event without waiting for queue space
    pub async fn try_publish(&self, event: DomainEvent) -> Result<(), EventBusError> {
        let (sender, event) = self.prepare(event).await?;

        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(EventBusError::QueueFull),
            Err(TrySendError::Closed(_)) => return Err(self.closed_error().await),
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Error for a send that found every receiver of its queue dropped
    async fn closed_error(&self) -> EventBusError {
        if self.state().await != BusState::Running {
            return EventBusError::BusNotRunning;
        }
        if self.config.enable_logging {
            error!("Event bus is running but its workers have exited");
        }
        EventBusError::WorkersUnavailable
    }

    async fn prepare(
        &self,
        mut event: DomainEvent,
    ) -> Result<(mpsc::Sender<DomainEvent>, DomainEvent), EventBusError> {
        let sender = {
            let runtime = self.runtime.read().await;
            if runtime.state != BusState::Running {
                return Err(EventBusError::BusNotRunning);
            }
            let index = partition(&event.aggregate_id, runtime.senders.len());
            runtime
                .senders
                .get(index)
                .cloned()
                .ok_or(EventBusError::BusNotRunning)?
        };

        event.metadata.insert(
            "published_at".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );

        if self.config.enable_logging {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                aggregate_id = %event.aggregate_id,
                version = event.version,
                "Publishing event"
            );
        }

        Ok((sender, event))
    }

    /// Copy of the recorded dead letters
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.clone()
    }

    /// Remove and return all dead letters
    pub async fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.dead_letters.lock().await)
    }

    /// Discard all dead letters
    pub async fn clear_dead_letters(&self) {
        self.dead_letters.lock().await.clear();
    }

    /// Publish every dead-lettered event again
    ///
    /// Each distinct event is published once and reaches all of its current
    /// handlers, including those that succeeded the first time. Returns the
    /// number of events requeued. On a publish failure the letters that were
    /// not requeued are put back.
    pub async fn requeue_dead_letters(&self) -> Result<usize, EventBusError> {
        let letters = self.drain_dead_letters().await;
        let mut requeued_ids = HashSet::new();

        let mut pending = letters.into_iter();
        while let Some(letter) = pending.next() {
            if requeued_ids.contains(&letter.event.id) {
                continue;
            }
            if let Err(e) = self.publish(letter.event.clone()).await {
                let mut dead_letters = self.dead_letters.lock().await;
                dead_letters.push(letter);
                dead_letters.extend(pending.filter(|l| !requeued_ids.contains(&l.event.id)));
                return Err(e);
            }
            requeued_ids.insert(letter.event.id);
        }

        let requeued = requeued_ids.len();

        if self.config.enable_logging && requeued > 0 {
            info!(requeued, "Requeued dead-lettered events");
        }

        Ok(requeued)
    }

    /// Get bus statistics
    pub async fn stats(&self) -> BusStats {
        let (state, worker_count, queue_depth, queue_capacity) = {
            let runtime = self.runtime.read().await;
            (
                runtime.state,
                runtime.workers.len(),
                runtime.queue_depth(),
                runtime.queue_capacity(),
            )
        };

        let mut registered_types: Vec<String> = self
            .handlers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        registered_types.sort();

        let total_handlers = self.handlers.iter().map(|entry| entry.value().len()).sum();

        BusStats {
            is_running: state == BusState::Running,
            state,
            worker_count,
            active_workers: self.counters.active_workers.load(Ordering::SeqCst),
            queue_depth,
            queue_capacity,
            dead_letter_count: self.dead_letters.lock().await.len(),
            registered_types,
            total_handlers,
            published: self.counters.published.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn build_queues(
    config: &EventBusConfig,
) -> (Vec<mpsc::Sender<DomainEvent>>, Vec<SharedReceiver>) {
    let queues = match config.dispatch_mode {
        DispatchMode::Shared => 1,
        DispatchMode::PartitionedByAggregate => config.worker_count,
    };
    // the remainder goes to the first queues so the total matches the config
    let base = config.queue_capacity / queues;
    let remainder = config.queue_capacity % queues;

    (0..queues)
        .map(|i| {
            let capacity = (base + usize::from(i < remainder)).max(1);
            let (tx, rx) = mpsc::channel(capacity);
            (tx, Arc::new(Mutex::new(rx)))
        })
        .unzip()
}

/// Stable queue index for an aggregate.
fn partition(aggregate_id: &str, queues: usize) -> usize {
    if queues <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() % queues as u64) as usize
}

/// Counts a worker as active until it is dropped, including on abort.
struct ActiveWorker(Arc<Counters>);

impl ActiveWorker {
    fn enter(counters: Arc<Counters>) -> Self {
        counters.active_workers.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Worker {
    id: usize,
    receiver: SharedReceiver,
    shutdown: watch::Receiver<bool>,
    handlers: Arc<DashMap<String, HandlerList>>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
    counters: Arc<Counters>,
    poll_interval: Duration,
    handler_timeout: Option<Duration>,
    log: bool,
    _active: ActiveWorker,
}

impl Worker {
    async fn run(mut self) {
        if self.log {
            debug!(worker = self.id, "Worker started");
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let receiver = Arc::clone(&self.receiver);
            let next = tokio::select! {
                biased;
                changed = self.shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => break,
                },
                received = tokio::time::timeout(self.poll_interval, async move {
                    receiver.lock().await.recv().await
                }) => received,
            };

            match next {
                Ok(Some(event)) => self.dispatch(event).await,
                // every sender is gone
                Ok(None) => break,
                // poll timeout
                Err(_) => continue,
            }
        }

        if self.log {
            debug!(worker = self.id, "Worker stopped");
        }
    }

    async fn dispatch(&self, event: DomainEvent) {
        let handlers = self
            .handlers
            .get(&event.event_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        if handlers.is_empty() && self.log {
            debug!(event_type = %event.event_type, "No handlers registered for event");
        }

        for handler in &handlers {
            let accepts = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler.can_handle(&event.event_type)
            }))
            .map_err(|panic| EventHandlerError::Panicked(panic_message(panic.as_ref())));

            let outcome = match accepts {
                Ok(false) => continue,
                Ok(true) => self.invoke(handler.as_ref(), &event).await,
                Err(err) => Err(err),
            };

            if let Err(err) = outcome {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);

                if self.log {
                    error!(
                        worker = self.id,
                        handler = handler.name(),
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %err,
                        "Event handler failed"
                    );
                }

                self.dead_letters.lock().await.push(DeadLetter::new(
                    event.clone(),
                    handler.name(),
                    &err,
                    self.id,
                ));
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    async fn invoke(
        &self,
        handler: &dyn EventHandler,
        event: &DomainEvent,
    ) -> Result<(), EventHandlerError> {
        let call = AssertUnwindSafe(handler.handle(event)).catch_unwind();

        let outcome = match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| EventHandlerError::Timeout(limit))?,
            None => call.await,
        };

        outcome.unwrap_or_else(|panic| Err(EventHandlerError::Panicked(panic_message(panic.as_ref()))))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Event bus errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is not running")]
    BusNotRunning,

    #[error("Event bus cannot start from state {0:?}")]
    AlreadyRunning(BusState),

    #[error("Event queue is full")]
    QueueFull,

    #[error("Event bus is running but its workers have exited")]
    WorkersUnavailable,

    #[error("Invalid event bus configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} worker(s) aborted after the shutdown grace period")]
    ShutdownTimedOut(usize),
}
