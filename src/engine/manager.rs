//! # Subscription lifecycle manager.
//!
//! [`StreamManager`] is the engine's front door: it validates and opens
//! subscriptions, binds each to a worker slot, starts its fallback timer,
//! fans out event-driven pushes on writes, and tears everything down exactly
//! once when the channel closes, whoever closed it.
//!
//! ```text
//!                 open_subscription(key, role, channel)
//!                               │
//!             exists? ──no──► reject (NotFound, channel errors out)
//!                │yes
//!                ▼
//!   ┌── pool.register ──► scheduler.start ──► watch channel.closed() ──┐
//!   │                                                                  │
//!   │   notify_write(record) ─► per-role project ─► gate ─► channels   │
//!   │                                                                  │
//!   └───────────── cleanup(id): stop timer, unregister, clear gate ◄───┘
//! ```
//!
//! ## Rules
//! - Cleanup is **idempotent**: it runs for whichever comes first of client
//!   disconnect, channel timeout, completion, or error, and later triggers
//!   find nothing to do.
//! - The gate entry for a (key, role) pair is cleared only when the departing
//!   subscription was the last one using that pair.
//! - `notify_write` projects once per role present among the key's
//!   subscribers, so an event-driven push carries exactly what that
//!   subscriber's own fallback tick would have produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::PushChannel;
use crate::config::Config;
use crate::error::{ChannelError, StreamError};
use crate::events::{Bus, Event, EventKind};
use crate::model::{project, Role, StatusRecord, VehicleKey};
use crate::store::StatusStore;
use crate::subscribers::{Subscribe, SubscriberSet};

use super::gate::{ChangeGate, GateDecision};
use super::pool::WorkerPool;
use super::scheduler::FallbackScheduler;
use super::subscription::SubscriptionId;

/// Point-in-time snapshot of the engine, for monitoring.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Live worker slots.
    pub pool_size: usize,
    /// Open subscriptions.
    pub active_subscriptions: usize,
    /// Registered subscriptions per worker slot, index-aligned.
    pub worker_loads: Vec<usize>,
    /// Distinct vehicle keys with at least one subscription, sorted.
    pub active_keys: Vec<Arc<str>>,
}

struct Subscription {
    key: VehicleKey,
    role: Role,
    channel: Arc<dyn PushChannel>,
}

struct Fanout {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Orchestrates subscriptions over the pool, scheduler, and gate.
pub struct StreamManager {
    store: Arc<dyn StatusStore>,
    gate: Arc<ChangeGate>,
    pool: WorkerPool,
    scheduler: FallbackScheduler,
    bus: Bus,
    subs: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    fanout: Mutex<Option<Fanout>>,
}

impl StreamManager {
    /// Creates an engine with no event subscribers.
    ///
    /// Must be called within a tokio runtime: the worker pool spawns its
    /// initial workers immediately.
    pub fn new(store: Arc<dyn StatusStore>, cfg: Config) -> Arc<Self> {
        Self::with_subscribers(store, cfg, Vec::new())
    }

    /// Creates an engine and attaches event subscribers.
    ///
    /// A fan-out listener forwards every bus event to the [`SubscriberSet`]
    /// until [`shutdown`](Self::shutdown).
    pub fn with_subscribers(
        store: Arc<dyn StatusStore>,
        cfg: Config,
        subscribers: Vec<Arc<dyn Subscribe>>,
    ) -> Arc<Self> {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let gate = Arc::new(ChangeGate::new(cfg.min_push_interval));
        let pool = WorkerPool::new(&cfg, bus.clone());
        let scheduler =
            FallbackScheduler::new(&cfg, Arc::clone(&store), Arc::clone(&gate), bus.clone());

        let fanout = if subscribers.is_empty() {
            None
        } else {
            Some(spawn_fanout(subscribers, bus.clone()))
        };

        Arc::new(Self {
            store,
            gate,
            pool,
            scheduler,
            bus,
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            fanout: Mutex::new(fanout),
        })
    }

    /// Opens a subscription for one viewer on one vehicle key.
    ///
    /// Fails fast with [`StreamError::NotFound`] if the key has never been
    /// written; the channel is completed with that error before returning.
    /// On success the subscription delivers until its channel closes.
    pub async fn open_subscription(
        self: &Arc<Self>,
        key: impl Into<VehicleKey>,
        role: Role,
        channel: Arc<dyn PushChannel>,
    ) -> Result<SubscriptionId, StreamError> {
        let key: VehicleKey = key.into();

        let exists = match self.store.exists(&key).await {
            Ok(exists) => exists,
            Err(err) => {
                channel.complete_with_error(err.clone());
                return Err(err);
            }
        };
        if !exists {
            let err = StreamError::NotFound {
                key: key.to_string(),
            };
            self.bus.publish(
                Event::now(EventKind::SubscriptionRejected)
                    .with_key(Arc::clone(&key))
                    .with_reason(err.as_label()),
            );
            channel.complete_with_error(err.clone());
            return Err(err);
        }

        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let worker = self.pool.register(id);
        {
            let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
            subs.insert(
                id,
                Subscription {
                    key: Arc::clone(&key),
                    role,
                    channel: Arc::clone(&channel),
                },
            );
        }
        self.scheduler
            .start(id, Arc::clone(&key), role, Arc::clone(&channel), worker.clone());
        self.bus.publish(
            Event::now(EventKind::SubscriptionOpened)
                .with_key(Arc::clone(&key))
                .with_role(role)
                .with_subscription(id)
                .with_worker(worker.index()),
        );

        // Whatever closes the channel first (client, timeout, completion,
        // error) funnels into one cleanup.
        let manager = Arc::clone(self);
        let closed = channel.closed();
        tokio::spawn(async move {
            closed.cancelled().await;
            manager.cleanup(id);
        });

        Ok(id)
    }

    /// Event-driven push: fans a fresh record out to the key's subscribers.
    ///
    /// Projects once per role present among them; each role's view goes
    /// through the gate independently, so a throttled or unchanged role
    /// stays quiet while another role still receives its first delivery.
    pub async fn notify_write(&self, record: &StatusRecord) {
        let targets: Vec<(SubscriptionId, Role, Arc<dyn PushChannel>)> = {
            let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|(_, s)| s.key == record.key)
                .map(|(id, s)| (*id, s.role, Arc::clone(&s.channel)))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut roles: Vec<Role> = targets.iter().map(|(_, role, _)| *role).collect();
        roles.sort();
        roles.dedup();

        for role in roles {
            let view = project(record, role);
            let decision = self.gate.decide(&record.key, role, &view);
            if decision != GateDecision::Send {
                self.bus.publish(
                    Event::now(EventKind::PushSkipped)
                        .with_key(Arc::clone(&record.key))
                        .with_role(role)
                        .with_reason(decision.as_label()),
                );
                continue;
            }

            let mut delivered = false;
            for (id, _, channel) in targets.iter().filter(|(_, r, _)| *r == role) {
                match channel.send(&view).await {
                    Ok(()) => {
                        delivered = true;
                        self.bus.publish(
                            Event::now(EventKind::PushDelivered)
                                .with_key(Arc::clone(&record.key))
                                .with_role(role)
                                .with_subscription(*id),
                        );
                    }
                    Err(err @ ChannelError::Full) => {
                        self.bus.publish(
                            Event::now(EventKind::PushSkipped)
                                .with_key(Arc::clone(&record.key))
                                .with_role(role)
                                .with_reason(err.as_label()),
                        );
                    }
                    // Settled channel; its close watcher cleans up.
                    Err(ChannelError::Closed) => {}
                }
            }
            if delivered {
                self.gate.record(&record.key, role, view);
            }
        }
    }

    /// Persists a record and pushes it to the key's subscribers.
    ///
    /// The write path of the system: save, then `notify_write`.
    pub async fn record_status(&self, record: StatusRecord) -> Result<StatusRecord, StreamError> {
        let stored = self.store.save(record).await?;
        self.notify_write(&stored).await;
        Ok(stored)
    }

    /// Snapshot of pool size, subscription counts, and watched keys.
    pub fn stats(&self) -> EngineStats {
        let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<Arc<str>> = subs.values().map(|s| Arc::clone(&s.key)).collect();
        keys.sort();
        keys.dedup();
        EngineStats {
            pool_size: self.pool.size(),
            active_subscriptions: subs.len(),
            worker_loads: self.pool.loads(),
            active_keys: keys,
        }
    }

    /// Observes the raw event stream.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Stops every subscription, retires all workers, clears the gate, and
    /// detaches event subscribers. Open channels complete normally.
    pub async fn shutdown(&self) {
        self.scheduler.stop_all();

        let drained: Vec<(SubscriptionId, Subscription)> = {
            let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
            subs.drain().collect()
        };
        for (id, sub) in drained {
            sub.channel.complete();
            self.bus.publish(
                Event::now(EventKind::SubscriptionClosed)
                    .with_key(sub.key)
                    .with_subscription(id)
                    .with_reason("shutdown"),
            );
        }

        self.pool.shutdown().await;
        self.gate.clear_all();

        let fanout = {
            let mut slot = self.fanout.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(fanout) = fanout {
            fanout.cancel.cancel();
            let _ = fanout.handle.await;
        }
    }

    /// Releases one subscription's resources. Safe to call repeatedly.
    fn cleanup(&self, id: SubscriptionId) {
        let removed = {
            let mut subs = self.subs.write().unwrap_or_else(|e| e.into_inner());
            subs.remove(&id)
        };
        let Some(sub) = removed else {
            return;
        };

        self.scheduler.stop(id);
        self.pool.unregister(id);

        let pair_in_use = {
            let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
            subs.values()
                .any(|s| s.key == sub.key && s.role == sub.role)
        };
        if !pair_in_use {
            self.gate.clear(&sub.key, sub.role);
        }

        let reason = sub
            .channel
            .close_reason()
            .map(|r| r.as_label())
            .unwrap_or("closed");
        self.bus.publish(
            Event::now(EventKind::SubscriptionClosed)
                .with_key(sub.key)
                .with_subscription(id)
                .with_reason(reason),
        );
    }
}

/// Forwards bus events to the subscriber set until cancelled.
fn spawn_fanout(subscribers: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Fanout {
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let mut rx = bus.subscribe();
    let set = SubscriberSet::new(subscribers, bus);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                ev = rx.recv() => match ev {
                    Ok(ev) => set.emit(Arc::new(ev)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        set.shutdown().await;
    });

    Fanout { cancel, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CloseReason, LocalChannel, LocalReceiver};
    use crate::store::MemoryStore;
    use std::time::{Duration, SystemTime};

    fn test_cfg() -> Config {
        Config {
            fallback_period: Duration::from_secs(1),
            channel_timeout: Duration::from_secs(3600),
            ..Config::default()
        }
    }

    async fn seeded_manager(cfg: Config, keys: &[&str]) -> Arc<StreamManager> {
        let store = Arc::new(MemoryStore::new());
        for key in keys {
            store
                .save(StatusRecord {
                    odometer: Some(1_000),
                    driver_id: Some("drv-1".into()),
                    ..StatusRecord::new(*key, SystemTime::UNIX_EPOCH)
                })
                .await
                .unwrap();
        }
        StreamManager::new(store, cfg)
    }

    async fn wait_until(manager: &StreamManager, pred: impl Fn(&EngineStats) -> bool) {
        for _ in 0..200 {
            if pred(&manager.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_key_is_rejected_immediately() {
        let manager = seeded_manager(test_cfg(), &[]).await;
        let mut events = manager.events();
        let (channel, rx) = LocalChannel::open(Duration::from_secs(3600));

        let err = manager
            .open_subscription("NOPE", Role::Base, channel)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NotFound { .. }));
        assert_eq!(rx.closed().await, CloseReason::Error);
        assert!(matches!(rx.close_error(), Some(StreamError::NotFound { .. })));

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::SubscriptionRejected);
        assert_eq!(manager.stats().active_subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_delivers_and_cleanup_follows_completion() {
        let manager = seeded_manager(test_cfg(), &["V2"]).await;
        let (channel, mut rx) = LocalChannel::open(Duration::from_secs(3600));

        manager
            .open_subscription("V2", Role::Full, Arc::clone(&channel) as Arc<dyn PushChannel>)
            .await
            .unwrap();
        let stats = manager.stats();
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.active_keys, vec![Arc::<str>::from("V2")]);

        let view = rx.recv().await.expect("fallback tick should deliver");
        assert_eq!(view.odometer, Some(1_000));

        // Client disconnect: channel settles, the watcher tears down.
        channel.complete();
        wait_until(&manager, |s| s.active_subscriptions == 0).await;
        assert!(manager.gate.is_empty());
        assert!(manager.scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notify_write_projects_per_subscriber_role() {
        let cfg = Config {
            fallback_period: Duration::from_secs(3600),
            ..test_cfg()
        };
        let manager = seeded_manager(cfg, &["V3"]).await;

        let (base_ch, mut base_rx) = LocalChannel::open(Duration::from_secs(3600));
        let (full_ch, mut full_rx) = LocalChannel::open(Duration::from_secs(3600));
        manager
            .open_subscription("V3", Role::Base, base_ch)
            .await
            .unwrap();
        manager
            .open_subscription("V3", Role::Full, full_ch)
            .await
            .unwrap();

        manager
            .record_status(StatusRecord {
                odometer: Some(2_000),
                driver_id: Some("drv-9".into()),
                ..StatusRecord::new("V3", SystemTime::UNIX_EPOCH + Duration::from_secs(60))
            })
            .await
            .unwrap();

        let base_view = base_rx.recv().await.unwrap();
        assert_eq!(base_view.odometer, Some(2_000));
        assert_eq!(base_view.driver_id, None);

        let full_view = full_rx.recv().await.unwrap();
        assert_eq!(full_view.odometer, Some(2_000));
        assert_eq!(full_view.driver_id.as_deref(), Some("drv-9"));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_write_within_the_interval_is_throttled() {
        let cfg = Config {
            fallback_period: Duration::from_secs(3600),
            ..test_cfg()
        };
        let manager = seeded_manager(cfg, &["V4"]).await;
        let mut events = manager.events();

        let (channel, mut rx) = LocalChannel::open(Duration::from_secs(3600));
        manager
            .open_subscription("V4", Role::Base, channel)
            .await
            .unwrap();

        let record = StatusRecord {
            odometer: Some(5_000),
            ..StatusRecord::new("V4", SystemTime::UNIX_EPOCH)
        };
        manager.notify_write(&record).await;
        assert!(rx.recv().await.is_some());

        // Second write lands inside min_push_interval.
        let record = StatusRecord {
            odometer: Some(5_001),
            ..record
        };
        manager.notify_write(&record).await;

        let mut throttled = false;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::PushSkipped && ev.reason.as_deref() == Some("throttled") {
                throttled = true;
            }
        }
        assert!(throttled);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_channel_skip_carries_the_channel_label() {
        let cfg = Config {
            fallback_period: Duration::from_secs(3600),
            min_push_interval: Duration::ZERO,
            ..test_cfg()
        };
        let manager = seeded_manager(cfg, &["V7"]).await;
        let mut events = manager.events();

        let (channel, _rx) = LocalChannel::open(Duration::from_secs(3600));
        manager
            .open_subscription("V7", Role::Base, channel)
            .await
            .unwrap();

        // Nobody drains the receiver, so the send buffer eventually fills
        // and later pushes are skipped with the channel's own label.
        for i in 0..32u64 {
            manager
                .notify_write(&StatusRecord {
                    odometer: Some(i),
                    ..StatusRecord::new("V7", SystemTime::UNIX_EPOCH)
                })
                .await;
        }

        let mut labeled = false;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::PushSkipped
                && ev.reason.as_deref() == Some(ChannelError::Full.as_label())
            {
                labeled = true;
            }
        }
        assert!(labeled);
        manager.shutdown().await;
    }

    /// Store whose keys are known but trimmed: `exists` passes, reads find
    /// nothing. Exercises the retry path behind a successful open.
    struct TrimmedStore;

    #[async_trait::async_trait]
    impl crate::store::StatusStore for TrimmedStore {
        async fn find_latest(&self, _key: &str) -> Result<Option<StatusRecord>, StreamError> {
            Ok(None)
        }

        async fn find_in_range(
            &self,
            _key: &str,
            _start: SystemTime,
            _end: SystemTime,
        ) -> Result<Vec<StatusRecord>, StreamError> {
            Ok(Vec::new())
        }

        async fn save(&self, record: StatusRecord) -> Result<StatusRecord, StreamError> {
            Ok(record)
        }

        async fn exists(&self, _key: &str) -> Result<bool, StreamError> {
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn known_but_unresolvable_key_completes_normally() {
        let cfg = Config {
            max_retry_new: 3,
            ..test_cfg()
        };
        let manager = StreamManager::new(Arc::new(TrimmedStore), cfg);
        let (channel, rx) = LocalChannel::open(Duration::from_secs(3600));

        manager
            .open_subscription("V1", Role::Base, channel)
            .await
            .unwrap();

        // Short threshold exhausted: a quiet, normal close, not an error.
        assert_eq!(rx.closed().await, CloseReason::Completed);
        assert!(rx.close_error().is_none());
        wait_until(&manager, |s| s.active_subscriptions == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_vehicle_stays_open_until_the_next_write() {
        let manager = seeded_manager(test_cfg(), &["V2"]).await;
        let (channel, mut rx) = LocalChannel::open(Duration::from_secs(3600));

        manager
            .open_subscription("V2", Role::Base, Arc::clone(&channel) as Arc<dyn PushChannel>)
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.odometer, Some(1_000));

        // 40 fallback periods with no new write: the record still resolves,
        // so the stream neither retries nor closes.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(channel.close_reason().is_none());
        assert_eq!(manager.stats().active_subscriptions, 1);

        // A write reaches the viewer without waiting for the next tick.
        manager
            .record_status(StatusRecord {
                odometer: Some(1_050),
                ..StatusRecord::new("V2", SystemTime::UNIX_EPOCH + Duration::from_secs(60))
            })
            .await
            .unwrap();
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.odometer, Some(1_050));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn many_subscriptions_grow_the_pool() {
        let manager = seeded_manager(test_cfg(), &["V5"]).await;
        let mut receivers: Vec<LocalReceiver> = Vec::new();

        for _ in 0..25 {
            let (channel, rx) = LocalChannel::open(Duration::from_secs(3600));
            manager
                .open_subscription("V5", Role::Base, channel)
                .await
                .unwrap();
            receivers.push(rx);
        }

        let stats = manager.stats();
        assert_eq!(stats.active_subscriptions, 25);
        assert_eq!(stats.pool_size, 3);
        assert_eq!(stats.worker_loads.iter().sum::<usize>(), 25);

        manager.shutdown().await;
        assert_eq!(manager.stats().active_subscriptions, 0);
        for rx in &receivers {
            assert_eq!(rx.close_reason(), Some(CloseReason::Completed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_survives_while_a_pair_is_still_in_use() {
        let cfg = Config {
            fallback_period: Duration::from_secs(3600),
            ..test_cfg()
        };
        let manager = seeded_manager(cfg, &["V6"]).await;

        let (ch_a, mut rx_a) = LocalChannel::open(Duration::from_secs(3600));
        let (ch_b, mut rx_b) = LocalChannel::open(Duration::from_secs(3600));
        manager
            .open_subscription("V6", Role::Base, Arc::clone(&ch_a) as Arc<dyn PushChannel>)
            .await
            .unwrap();
        manager
            .open_subscription("V6", Role::Base, ch_b)
            .await
            .unwrap();

        manager
            .notify_write(&StatusRecord::new("V6", SystemTime::UNIX_EPOCH))
            .await;
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        assert_eq!(manager.gate.len(), 1);

        // First subscriber leaves; the shared gate entry must survive.
        ch_a.complete();
        wait_until(&manager, |s| s.active_subscriptions == 1).await;
        assert_eq!(manager.gate.len(), 1);

        manager.shutdown().await;
        assert!(manager.gate.is_empty());
    }
}
