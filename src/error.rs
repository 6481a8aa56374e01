//! Error types used by the delivery engine and its collaborators.
//!
//! Two enums cover the taxonomy:
//!
//! - [`StreamError`] — subscription-level failures (unknown vehicle at open,
//!   a broken tick, a failing store).
//! - [`ChannelError`] — push-path failures local to one delivery channel.
//!
//! Transient absence (a vehicle that resolved before but does not now) is
//! deliberately **not** an error: the fallback scheduler retries it silently
//! up to its extended threshold and then completes the channel normally.
//! Both types provide `as_label` for stable snake_case labels in events.

use thiserror::Error;

/// Failures local to one subscription.
///
/// Every variant affects exactly one subscription; none propagates to other
/// subscriptions or to the engine itself.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// The vehicle key never resolved at subscription open.
    ///
    /// Surfaced to the caller immediately; never retried.
    #[error("vehicle {key} not found")]
    NotFound {
        /// The key that failed to resolve.
        key: String,
    },

    /// The delivery channel closed while the engine still held it.
    #[error("delivery channel closed")]
    ChannelClosed,

    /// The persistence collaborator failed a read or write.
    #[error("store failure: {reason}")]
    Store {
        /// Collaborator-provided description.
        reason: String,
    },

    /// Unexpected failure inside a scheduled tick or push.
    ///
    /// Not retried: the channel closes with this error and the subscription
    /// is torn down immediately.
    #[error("tick failure: {reason}")]
    Tick {
        /// What broke.
        reason: String,
    },
}

impl StreamError {
    /// Returns a short stable label (snake_case) for events and metrics.
    ///
    /// # Example
    /// ```
    /// use fleetstream::StreamError;
    ///
    /// let err = StreamError::NotFound { key: "V1".into() };
    /// assert_eq!(err.as_label(), "stream_not_found");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            StreamError::NotFound { .. } => "stream_not_found",
            StreamError::ChannelClosed => "stream_channel_closed",
            StreamError::Store { .. } => "stream_store_failure",
            StreamError::Tick { .. } => "stream_tick_failure",
        }
    }
}

/// Failures of a single push on a delivery channel.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel already completed, timed out, or errored.
    #[error("channel is closed")]
    Closed,

    /// The channel's outbound buffer is full.
    ///
    /// The push is dropped; the gate was not committed, so the same change
    /// is re-attempted on the next fallback tick.
    #[error("channel buffer is full")]
    Full,
}

impl ChannelError {
    /// Returns a short stable label (snake_case) for events and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ChannelError::Closed => "channel_closed",
            ChannelError::Full => "channel_full",
        }
    }
}
