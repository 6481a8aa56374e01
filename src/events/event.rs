//! # Runtime events emitted by the delivery engine.
//!
//! [`EventKind`] classifies events across four categories:
//! - **Subscription lifecycle**: opened, rejected, closed
//! - **Delivery**: pushed, skipped, stream completed/failed
//! - **Pool**: grew, shrank, tick overflow
//! - **Subscriber plumbing**: overflow, panic
//!
//! The [`Event`] struct carries optional metadata (vehicle key, role,
//! subscription id, worker index, retry progress, reason) attached with
//! builder methods.
//!
//! ## Ordering
//! Each event gets a globally unique, monotonically increasing sequence
//! number (`seq`); use it to restore order when events are observed through
//! independently lagging receivers.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::model::Role;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of engine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscription lifecycle ===
    /// A subscription was accepted and bound to a worker.
    ///
    /// Sets: `key`, `role`, `subscription`, `worker`.
    SubscriptionOpened,

    /// A subscription request was rejected (vehicle key never resolved).
    ///
    /// Sets: `key`, `reason`.
    SubscriptionRejected,

    /// A subscription's resources were released.
    ///
    /// Sets: `key`, `subscription`, `reason` (close reason label).
    SubscriptionClosed,

    // === Delivery ===
    /// A view was pushed to a channel and committed to the gate.
    ///
    /// Sets: `key`, `role`, `subscription`.
    PushDelivered,

    /// A candidate view was withheld by the change gate.
    ///
    /// Sets: `key`, `role`, `reason` (`"throttled"` or `"unchanged"`).
    PushSkipped,

    /// A fallback tick found no record for the key.
    ///
    /// Sets: `key`, `subscription`, `retries`, `retry_limit`.
    VehicleUnseen,

    /// A stream completed normally (retry threshold exhausted).
    ///
    /// Sets: `key`, `subscription`, `retries`.
    StreamCompleted,

    /// A stream closed with an error (unexpected tick/push failure).
    ///
    /// Sets: `key`, `subscription`, `reason`.
    StreamFailed,

    // === Worker pool ===
    /// The pool grew by one slot under load.
    ///
    /// Sets: `worker` (new slot index).
    PoolGrew,

    /// The pool retired its tail slot.
    ///
    /// Sets: `worker` (retired slot index).
    PoolShrank,

    /// A worker queue was full; one fallback tick was skipped.
    ///
    /// Sets: `key`, `subscription`, `worker`.
    TickOverflow,

    // === Subscriber plumbing ===
    /// An event subscriber dropped an event (queue full or closed).
    ///
    /// Sets: `reason` (`"subscriber=<name> reason=<why>"`).
    SubscriberOverflow,

    /// An event subscriber panicked while handling an event.
    ///
    /// Sets: `reason` (panic payload).
    SubscriberPanicked,
}

/// Engine event with optional metadata.
///
/// - `seq`: monotone global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other fields are set depending on the [`EventKind`]
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Vehicle key, if applicable.
    pub key: Option<Arc<str>>,
    /// Viewer role, if applicable.
    pub role: Option<Role>,
    /// Subscription id, if applicable.
    pub subscription: Option<u64>,
    /// Worker slot index, if applicable.
    pub worker: Option<usize>,
    /// Consecutive absent ticks so far.
    pub retries: Option<u32>,
    /// Threshold in effect for those retries.
    pub retry_limit: Option<u32>,
    /// Human-readable reason (errors, skip causes, close reasons).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates an event of the given kind with the current timestamp and the
    /// next global sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            key: None,
            role: None,
            subscription: None,
            worker: None,
            retries: None,
            retry_limit: None,
            reason: None,
        }
    }

    /// Attaches a vehicle key.
    #[inline]
    pub fn with_key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attaches a viewer role.
    #[inline]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Attaches a subscription id.
    #[inline]
    pub fn with_subscription(mut self, id: u64) -> Self {
        self.subscription = Some(id);
        self
    }

    /// Attaches a worker slot index.
    #[inline]
    pub fn with_worker(mut self, index: usize) -> Self {
        self.worker = Some(index);
        self
    }

    /// Attaches retry progress against its threshold.
    #[inline]
    pub fn with_retries(mut self, retries: u32, limit: u32) -> Self {
        self.retries = Some(retries);
        self.retry_limit = Some(limit);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, why: &'static str) -> Self {
        Event::now(EventKind::SubscriberOverflow)
            .with_reason(format!("subscriber={subscriber} reason={why}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::now(EventKind::SubscriberPanicked)
            .with_reason(format!("subscriber={subscriber} panic={info}"))
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }
}
