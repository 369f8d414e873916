//! In-process event bus.
//!
//! A multi-producer, multi-subscriber broadcast of [`Event`] built on
//! `tokio::sync::broadcast`. Publishing never blocks; slow subscribers lag
//! and may miss intermediate events, but each subscriber observes a single
//! publisher's events in publish order.

use std::sync::Arc;
use tokio::sync::broadcast;

pub mod events;
pub use events::*;

/// Per-subscriber ring capacity. Sized to absorb bursts from adapter poll
/// cycles without lagging interactive consumers.
pub const BUS_CAPACITY: usize = 256;

/// Handle for publishing and subscribing. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a bus behind the [`SharedBus`] alias the rest of the crate
    /// passes around.
    pub fn shared() -> SharedBus {
        Arc::new(Self::default())
    }

    /// Broadcast an event to current subscribers. A send with no subscribers
    /// is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events from this point on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// The bus as shared by every component. The bus is a leaf resource: handles
/// and adapters hold references to it, never the reverse.
pub type SharedBus = Arc<EventBus>;
