//! Single-consumer, fire-and-forget event bus.
//!
//! `publish()` appends to an unbounded FIFO and returns immediately. One
//! consumer task drains the queue and invokes the handler registered for each
//! event type, one event at a time, in publish order.
//!
//! ## Failure isolation
//!
//! A handler that returns an error or panics is logged and skipped; delivery
//! continues with the next event. Events with no registered handler are dropped
//! with a warning.
//!
//! ## Lifecycle
//!
//! The bus is an explicit service object: build it once, `register` handlers,
//! then `start()`. `stop()` waits for the handler currently running (if any),
//! then discards whatever is still queued. Publishing while stopped loses the
//! event and returns [`BusError::Stopped`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::Event;
use crate::handler::EventHandler;

/// Floor for the consumer's bounded wait.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

type HandlerMap = HashMap<String, Arc<dyn EventHandler>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bus is not running; the event was discarded.
    #[error("event bus is not running; event {0} dropped")]
    Stopped(String),
}

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Upper bound on how long the consumer waits for an event before
    /// re-checking the shutdown flag.
    pub poll_interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            name: "event-bus".to_string(),
        }
    }
}

impl EventBusConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }
}

struct Running {
    sender: mpsc::UnboundedSender<Event>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct EventBus {
    config: EventBusConfig,
    handlers: Arc<RwLock<HandlerMap>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.config.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Register the handler for `event_type`, replacing any previous one.
    ///
    /// Handlers may be registered before or after `start()`.
    pub fn register<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: EventHandler,
    {
        let event_type = event_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(event_type.clone(), Arc::new(handler)).is_some() {
            debug!(bus = %self.config.name, event_type = %event_type, "replaced event handler");
        }
    }

    /// Queue an event for delivery and return without waiting for the handler.
    pub fn publish(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        let event = Event::new(event_type, payload);
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        match running.as_ref() {
            Some(r) => r
                .sender
                .send(event)
                .map_err(|rejected| BusError::Stopped(rejected.0.event_type)),
            None => Err(BusError::Stopped(event.event_type)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Spawn the consumer loop. Calling `start()` on a running bus is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            debug!(bus = %self.config.name, "event bus already running");
            return;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(consume(
            self.config.clone(),
            self.handlers.clone(),
            receiver,
            shutdown_rx,
        ));

        *running = Some(Running {
            sender,
            shutdown,
            join,
        });
    }

    /// Stop consuming. Returns once the in-flight handler (if any) has finished.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(Running {
            sender,
            shutdown,
            join,
        }) = running
        else {
            return;
        };

        // Dropping the sender first means nothing can be queued after this point.
        drop(sender);
        let _ = shutdown.send(true);

        if let Err(err) = join.await {
            error!(bus = %self.config.name, error = %err, "event bus consumer task failed");
        }
    }
}

async fn consume(
    config: EventBusConfig,
    handlers: Arc<RwLock<HandlerMap>>,
    mut receiver: mpsc::UnboundedReceiver<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(bus = %config.name, "event bus started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = tokio::time::timeout(config.poll_interval, receiver.recv()) => match next {
                Err(_idle) => continue,
                Ok(None) => break,
                Ok(Some(event)) => dispatch(&config, &handlers, event).await,
            },
        }
    }

    let mut dropped = 0usize;
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(bus = %config.name, dropped, "event bus stopped with undelivered events");
    }
    info!(bus = %config.name, "event bus stopped");
}

async fn dispatch(config: &EventBusConfig, handlers: &RwLock<HandlerMap>, event: Event) {
    let handler = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&event.event_type)
        .cloned();

    let Some(handler) = handler else {
        warn!(
            bus = %config.name,
            event_type = %event.event_type,
            event_id = %event.id,
            "no handler registered; dropping event"
        );
        return;
    };

    match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(bus = %config.name, event_type = %event.event_type, event_id = %event.id, "event handled");
        }
        Ok(Err(err)) => {
            error!(
                bus = %config.name,
                event_type = %event.event_type,
                event_id = %event.id,
                error = ?err,
                "event handler failed"
            );
        }
        Err(panic) => {
            error!(
                bus = %config.name,
                event_type = %event.event_type,
                event_id = %event.id,
                panic = %panic_message(panic.as_ref()),
                "event handler panicked"
            );
        }
    }
}

/// Render a caught panic payload for logging.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
