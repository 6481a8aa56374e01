//! # Event bus for broadcasting engine events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] providing
//! non-blocking publishing from many sources (scheduler ticks, the pool, the
//! lifecycle manager).
//!
//! ## Architecture
//! ```text
//! Publishers (many):                    Subscriber (one):
//!   tick N    ──┐
//!   pool      ──┼──────► Bus ─────────► fan-out listener ───► SubscriberSet
//!   manager   ──┘  (broadcast chan)    (in StreamManager)
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks or awaits.
//! - **Bounded capacity**: one ring buffer of recent events for all receivers.
//! - **Lag handling**: slow receivers observe `RecvError::Lagged(n)` and skip
//!   the `n` oldest items.
//! - **No persistence**: events with no active receiver are dropped.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for engine events.
///
/// Cheap to clone (holds an `Arc`-backed sender); every engine component
/// that publishes holds its own clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus with the given ring capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Event>(capacity);
        Self { tx }
    }

    /// Publishes an event to all active receivers.
    ///
    /// If nobody is subscribed, the event is dropped; the call still returns
    /// immediately.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates an independent receiver observing subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn receiver_sees_events_published_after_subscribe() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::now(EventKind::PoolGrew).with_worker(2));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::PoolGrew);
        assert_eq!(ev.worker, Some(2));
    }

    #[test]
    fn publish_without_receivers_is_a_noop() {
        let bus = Bus::new(1);
        bus.publish(Event::now(EventKind::PoolShrank));
    }
}
