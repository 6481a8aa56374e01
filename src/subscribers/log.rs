//! # Simple logging subscriber for debugging and demos.
//!
//! [`LogWriter`] prints events to stdout in a human-readable format.
//!
//! ## Output format
//! ```text
//! [opened] key=V-100 role=elevated sub=4 worker=1
//! [push] key=V-100 role=elevated sub=4
//! [skip] key=V-100 role=elevated reason=unchanged
//! [unseen] key=V-200 sub=5 retry=12/180
//! [completed] key=V-200 sub=5
//! [pool-grew] worker=3
//! ```
//!
//! Not intended for production use — implement a custom
//! [`Subscribe`](crate::Subscribe) for structured logging or metrics.

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Simple stdout logging subscriber.
#[derive(Default)]
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let key = e.key.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::SubscriptionOpened => {
                println!(
                    "[opened] key={key} role={} sub={:?} worker={:?}",
                    e.role.map_or("-", |r| r.as_str()),
                    e.subscription,
                    e.worker
                );
            }
            EventKind::SubscriptionRejected => {
                println!("[rejected] key={key} reason={:?}", e.reason);
            }
            EventKind::SubscriptionClosed => {
                println!("[closed] key={key} sub={:?} reason={:?}", e.subscription, e.reason);
            }
            EventKind::PushDelivered => {
                println!(
                    "[push] key={key} role={} sub={:?}",
                    e.role.map_or("-", |r| r.as_str()),
                    e.subscription
                );
            }
            EventKind::PushSkipped => {
                println!(
                    "[skip] key={key} role={} reason={:?}",
                    e.role.map_or("-", |r| r.as_str()),
                    e.reason
                );
            }
            EventKind::VehicleUnseen => {
                println!(
                    "[unseen] key={key} sub={:?} retry={}/{}",
                    e.subscription,
                    e.retries.unwrap_or(0),
                    e.retry_limit.unwrap_or(0)
                );
            }
            EventKind::StreamCompleted => {
                println!("[completed] key={key} sub={:?}", e.subscription);
            }
            EventKind::StreamFailed => {
                println!("[failed] key={key} sub={:?} err={:?}", e.subscription, e.reason);
            }
            EventKind::PoolGrew => {
                println!("[pool-grew] worker={:?}", e.worker);
            }
            EventKind::PoolShrank => {
                println!("[pool-shrank] worker={:?}", e.worker);
            }
            EventKind::TickOverflow => {
                println!("[tick-overflow] key={key} sub={:?} worker={:?}", e.subscription, e.worker);
            }
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => {
                println!("[subscriber-issue] reason={:?}", e.reason);
            }
        }
    }

    fn name(&self) -> &'static str {
        "log_writer"
    }
}
