//! In-process event bus for internal notifications.
//!
//! Fire-and-forget, at-most-once delivery. Nothing here is persisted: if the
//! process stops, queued events are gone. Durable work belongs in the job store.

pub mod bus;
pub mod event;
pub mod handler;

pub use bus::{BusError, EventBus, EventBusConfig, panic_message};
pub use event::{Event, event_types};
pub use handler::EventHandler;
