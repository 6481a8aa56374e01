//! # Delivery channel collaborator.
//!
//! The engine pushes views into a [`PushChannel`]; the transport that turns
//! a view into bytes on a client socket lives outside the crate. The trait
//! mirrors the contract of a server-sent-event emitter: `send`, `complete`,
//! `complete_with_error`, and a close-notification surface where **exactly
//! one** of completed / timed-out / error is recorded per channel lifetime.
//!
//! [`LocalChannel`] is the in-process implementation used by tests and
//! demos; it carries the overall channel timeout itself.

mod local;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ChannelError, StreamError};
use crate::model::ProjectedView;

pub use local::{LocalChannel, LocalReceiver};

/// Why a channel closed. At most one reason is ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `complete()` — normal end of stream.
    Completed,
    /// The channel's overall lifetime elapsed.
    TimedOut,
    /// `complete_with_error()` — the stream failed.
    Error,
}

impl CloseReason {
    /// Stable label for events and logs.
    pub fn as_label(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::TimedOut => "timed_out",
            CloseReason::Error => "error",
        }
    }
}

/// Outbound seam for one subscription's delivery session.
///
/// ## Rules
/// - `send` fails once the channel is closed; it never blocks the caller
///   beyond its own buffering discipline.
/// - The first of `complete` / `complete_with_error` / an internal timeout
///   wins; later calls are no-ops. The winner is observable via
///   [`close_reason`](PushChannel::close_reason) after
///   [`closed`](PushChannel::closed) fires.
#[async_trait]
pub trait PushChannel: Send + Sync + 'static {
    /// Pushes one view to the viewer.
    async fn send(&self, view: &ProjectedView) -> Result<(), ChannelError>;

    /// Ends the stream normally.
    fn complete(&self);

    /// Ends the stream with an error.
    fn complete_with_error(&self, err: StreamError);

    /// Token cancelled exactly when the channel closes, whatever the reason.
    ///
    /// The lifecycle manager awaits this to run its cleanup routine.
    fn closed(&self) -> CancellationToken;

    /// The recorded close reason; `None` while the channel is still open.
    fn close_reason(&self) -> Option<CloseReason>;
}
