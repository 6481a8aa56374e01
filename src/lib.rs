//! # fleetstream
//!
//! **Fleetstream** is a live-delivery engine for vehicle status streams.
//!
//! Viewers subscribe to one vehicle key with a role; the engine keeps each
//! subscription fed through two paths — an event-driven push on every write
//! and a periodic fallback re-check — while a change gate makes sure a
//! viewer only ever receives views that are both fresh enough and actually
//! different from what they last saw.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   open_subscription(key, role, channel)        record_status(record)
//!                  │                                      │
//! ┌────────────────▼──────────────────────────────────────▼─────────────┐
//! │  StreamManager (lifecycle orchestrator)                             │
//! │  - validates keys against the StatusStore                           │
//! │  - Bus (broadcast events)                                           │
//! │  - SubscriberSet (fans out to user subscribers)                     │
//! │  - per-subscription close watcher → idempotent cleanup              │
//! └──────┬──────────────────────┬──────────────────────┬────────────────┘
//!        ▼                      ▼                      ▼
//! ┌──────────────┐      ┌───────────────┐      ┌──────────────┐
//! │  WorkerPool  │      │   Fallback    │      │  ChangeGate  │
//! │ (slot arena, │◄─────│   Scheduler   │─────►│ (key, role)→ │
//! │  grows 2..8) │ jobs │ (30s re-check │      │ last view +  │
//! │              │      │  per stream)  │      │ last sent at │
//! └──────┬───────┘      └───────────────┘      └──────────────┘
//!        │ tick: find_latest → advance state → project(role) → gate
//!        ▼
//!   PushChannel::send(view)  ──►  viewer
//! ```
//!
//! ### Subscription lifecycle
//! ```text
//! open_subscription(key, role, channel)
//!   ├─ store.exists(key)? ── no ──► NotFound, channel errors out
//!   ├─ pool.register(id)          (least-loaded slot, grows when saturated)
//!   ├─ scheduler.start(id)        (jittered first tick, then every period)
//!   └─ watch channel.closed()
//!
//! each tick {
//!   ├─ find_latest(key)
//!   │    ├─ Some(record) ─► reset retries, project, gate, maybe push
//!   │    └─ None ─────────► retries += 1
//!   │         ├─ never seen, retries > 30  ─► complete normally
//!   │         └─ seen before, retries > 180 ─► complete normally
//!   └─ store failure ─► complete with error
//! }
//!
//! channel closes (client gone | timeout | completed | error)
//!   └─► cleanup(id): stop timer, unregister from pool,
//!       clear gate entry if last (key, role) user  [idempotent]
//! ```
//!
//! ## Features
//! | Area               | Description                                               | Key types / traits                     |
//! |--------------------|-----------------------------------------------------------|----------------------------------------|
//! | **Subscriptions**  | Open, deliver, and tear down per-viewer streams.          | [`StreamManager`], [`SubscriptionId`]  |
//! | **Projection**     | Role-filtered views over status records.                  | [`Role`], [`ProjectedView`], [`project`] |
//! | **Throttling**     | Change- and interval-gated delivery per (key, role).      | [`ChangeGate`], [`GateDecision`]       |
//! | **Scheduling**     | Elastic worker pool and per-stream fallback timers.       | [`WorkerPool`], [`FallbackScheduler`]  |
//! | **Collaborators**  | Storage and transport seams the engine consumes.          | [`StatusStore`], [`PushChannel`]       |
//! | **Subscriber API** | Hook into engine events (logging, metrics).               | [`Subscribe`], [`Event`]               |
//! | **Errors**         | Typed errors for subscriptions and channels.              | [`StreamError`], [`ChannelError`]      |
//! | **Configuration**  | Centralize pool, retry, and throttle settings.            | [`Config`]                             |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::{Duration, SystemTime};
//! use fleetstream::{Config, LocalChannel, MemoryStore, Role, StatusRecord, StatusStore, StreamManager};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     store.save(StatusRecord::new("V-100", SystemTime::now())).await?;
//!
//!     let manager = StreamManager::new(store, Config::default());
//!
//!     // A viewer opens a stream on V-100 with the Elevated role.
//!     let (channel, mut rx) = LocalChannel::open(Duration::from_secs(300));
//!     manager.open_subscription("V-100", Role::Elevated, channel).await?;
//!
//!     // A new status write is pushed to the viewer immediately.
//!     let mut update = StatusRecord::new("V-100", SystemTime::now());
//!     update.fuel_level = Some(72);
//!     manager.record_status(update).await?;
//!
//!     let view = rx.recv().await.expect("pushed view");
//!     assert_eq!(view.fuel_level, Some(72));
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod config;
mod engine;
mod error;
mod events;
mod model;
mod store;
mod subscribers;

pub use channel::{CloseReason, LocalChannel, LocalReceiver, PushChannel};
pub use config::Config;
pub use engine::{
    ChangeGate, EngineStats, FallbackScheduler, GateDecision, StreamManager, SubscriptionId,
    SubscriptionPhase, SubscriptionState, TickAction, TickJob, TickOutcome, WorkerPool, WorkerRef,
};
pub use error::{ChannelError, StreamError};
pub use events::{Bus, Event, EventKind};
pub use model::{
    name_visible_to, project, EngineState, Field, ProjectedView, Role, StatusRecord, VehicleKey,
};
pub use store::{MemoryStore, StatusStore};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
