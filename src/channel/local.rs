//! # In-process delivery channel.
//!
//! [`LocalChannel`] pairs a bounded mpsc queue with the close-once semantics
//! the engine relies on. The receiving half ([`LocalReceiver`]) stands in
//! for a client connection: a test (or demo) drains views from it and can
//! observe the close reason once the stream ends.
//!
//! The channel owns its lifetime: [`LocalChannel::open`] spawns a timer that
//! closes the channel with [`CloseReason::TimedOut`] when the configured
//! overall timeout elapses first.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ChannelError, StreamError};
use crate::model::ProjectedView;

use super::{CloseReason, PushChannel};

/// Buffered views per channel before `send` reports backpressure.
const SEND_BUFFER: usize = 16;

/// In-process [`PushChannel`] backed by a bounded mpsc queue.
pub struct LocalChannel {
    tx: mpsc::Sender<ProjectedView>,
    close: CancellationToken,
    verdict: Mutex<Option<Verdict>>,
}

struct Verdict {
    reason: CloseReason,
    error: Option<StreamError>,
}

/// Client half of a [`LocalChannel`].
pub struct LocalReceiver {
    rx: mpsc::Receiver<ProjectedView>,
    channel: Arc<LocalChannel>,
}

impl LocalChannel {
    /// Opens a channel with the given overall lifetime.
    ///
    /// Must be called within a tokio runtime: the lifetime timer is a
    /// spawned task that fires [`CloseReason::TimedOut`] unless the channel
    /// closes first.
    pub fn open(timeout: Duration) -> (Arc<Self>, LocalReceiver) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        let channel = Arc::new(Self {
            tx,
            close: CancellationToken::new(),
            verdict: Mutex::new(None),
        });

        let timer = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.close.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    timer.settle(CloseReason::TimedOut, None);
                }
            }
        });

        let receiver = LocalReceiver {
            rx,
            channel: Arc::clone(&channel),
        };
        (channel, receiver)
    }

    /// Records the close verdict; only the first caller wins.
    fn settle(&self, reason: CloseReason, error: Option<StreamError>) {
        {
            let mut verdict = self.verdict.lock().unwrap_or_else(|e| e.into_inner());
            if verdict.is_some() {
                return;
            }
            *verdict = Some(Verdict { reason, error });
        }
        self.close.cancel();
    }

    /// The error recorded by `complete_with_error`, if that was the verdict.
    pub fn close_error(&self) -> Option<StreamError> {
        self.verdict
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|v| v.error.clone())
    }
}

#[async_trait]
impl PushChannel for LocalChannel {
    async fn send(&self, view: &ProjectedView) -> Result<(), ChannelError> {
        if self.close.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        match self.tx.try_send(view.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ChannelError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    fn complete(&self) {
        self.settle(CloseReason::Completed, None);
    }

    fn complete_with_error(&self, err: StreamError) {
        self.settle(CloseReason::Error, Some(err));
    }

    fn closed(&self) -> CancellationToken {
        self.close.clone()
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.verdict
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|v| v.reason)
    }
}

impl LocalReceiver {
    /// Receives the next view; `None` once the channel closed and drained.
    pub async fn recv(&mut self) -> Option<ProjectedView> {
        tokio::select! {
            view = self.rx.recv() => view,
            _ = self.channel.close.cancelled() => {
                // Channel settled; drain anything already buffered.
                self.rx.try_recv().ok()
            }
        }
    }

    /// Waits until the channel closes and returns the verdict.
    pub async fn closed(&self) -> CloseReason {
        self.channel.close.cancelled().await;
        self.channel
            .close_reason()
            .unwrap_or(CloseReason::Completed)
    }

    /// The close reason, if the channel already settled.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.channel.close_reason()
    }

    /// The close error, if the channel failed.
    pub fn close_error(&self) -> Option<StreamError> {
        self.channel.close_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn view(key: &str) -> ProjectedView {
        crate::model::project(
            &crate::model::StatusRecord::new(key, SystemTime::UNIX_EPOCH),
            crate::model::Role::Base,
        )
    }

    #[tokio::test]
    async fn first_verdict_wins() {
        let (channel, rx) = LocalChannel::open(Duration::from_secs(60));
        channel.complete();
        channel.complete_with_error(StreamError::ChannelClosed);
        assert_eq!(channel.close_reason(), Some(CloseReason::Completed));
        assert!(rx.close_error().is_none());
    }

    #[tokio::test]
    async fn send_fails_after_close() {
        let (channel, _rx) = LocalChannel::open(Duration::from_secs(60));
        channel.complete();
        let err = channel.send(&view("V1")).await.unwrap_err();
        assert_eq!(err, ChannelError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_timeout_settles_the_channel() {
        let (channel, rx) = LocalChannel::open(Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(rx.closed().await, CloseReason::TimedOut);
        assert!(channel.send(&view("V1")).await.is_err());
    }

    #[tokio::test]
    async fn views_flow_until_complete() {
        let (channel, mut rx) = LocalChannel::open(Duration::from_secs(60));
        channel.send(&view("V1")).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(&*got.key, "V1");
        channel.complete();
        assert_eq!(rx.closed().await, CloseReason::Completed);
    }
}
