//! # Fallback scheduler: periodic re-checks per subscription.
//!
//! Every subscription gets one timer loop. The loop itself does no I/O: on
//! each tick it packages the store lookup, the state transition, and the
//! delivery attempt into a job and hands it to the subscription's worker
//! slot. A full worker queue means the tick is skipped and reported, never
//! queued unboundedly, and a skipped tick does not advance retry counters.
//!
//! ```text
//!  timer loop (1 per subscription)        worker slot (shared)
//!  ┌─────────────────────────┐            ┌──────────────────────┐
//!  │ jitter, then every      │  try_send  │ find_latest → advance│
//!  │ `period`: build job ────┼───────────►│ → project → gate →   │
//!  │ (full queue: skip+event)│            │ push / complete      │
//!  └─────────────────────────┘            └──────────────────────┘
//! ```
//!
//! ## Rules
//! - The first tick fires after a random offset within one period, so many
//!   subscriptions opened together do not tick in lockstep.
//! - [`FallbackScheduler::stop`] cancels the timer loop only; a tick already
//!   dispatched to its worker runs to completion.
//! - Threshold exhaustion completes the channel normally; an unexpected
//!   store failure completes it with an error. Both stop the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channel::PushChannel;
use crate::config::Config;
use crate::error::{ChannelError, StreamError};
use crate::events::{Bus, Event, EventKind};
use crate::model::{project, Role, StatusRecord, VehicleKey};
use crate::store::StatusStore;

use super::gate::{ChangeGate, GateDecision};
use super::pool::WorkerRef;
use super::subscription::{SubscriptionId, SubscriptionState, TickAction, TickOutcome};

struct TaskHandle {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Owns one timer loop per live subscription.
pub struct FallbackScheduler {
    store: Arc<dyn StatusStore>,
    gate: Arc<ChangeGate>,
    bus: Bus,
    period: Duration,
    max_retry_new: u32,
    max_retry_seen: u32,
    tasks: RwLock<HashMap<SubscriptionId, TaskHandle>>,
}

impl FallbackScheduler {
    pub fn new(cfg: &Config, store: Arc<dyn StatusStore>, gate: Arc<ChangeGate>, bus: Bus) -> Self {
        Self {
            store,
            gate,
            bus,
            period: cfg.fallback_period_clamped(),
            max_retry_new: cfg.max_retry_new,
            max_retry_seen: cfg.max_retry_seen,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Starts the timer loop for one subscription.
    pub fn start(
        &self,
        id: SubscriptionId,
        key: VehicleKey,
        role: Role,
        channel: Arc<dyn PushChannel>,
        worker: WorkerRef,
    ) {
        let cancel = CancellationToken::new();
        let loop_ctx = TickContext {
            id,
            key,
            role,
            channel,
            state: Arc::new(Mutex::new(SubscriptionState::new())),
            store: Arc::clone(&self.store),
            gate: Arc::clone(&self.gate),
            bus: self.bus.clone(),
            stop: cancel.clone(),
            short: self.max_retry_new,
            extended: self.max_retry_seen,
        };
        let period = self.period;
        let bus = self.bus.clone();

        let handle = tokio::spawn(async move {
            let jitter = initial_jitter(period);
            tokio::select! {
                _ = loop_ctx.stop.cancelled() => return,
                _ = tokio::time::sleep(jitter) => {}
            }

            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_ctx.stop.cancelled() => return,
                    _ = ticks.tick() => {}
                }

                let job = loop_ctx.clone();
                if !worker.try_dispatch(async move { job.run().await }.boxed()) {
                    bus.publish(
                        Event::now(EventKind::TickOverflow)
                            .with_key(Arc::clone(&loop_ctx.key))
                            .with_subscription(loop_ctx.id)
                            .with_worker(worker.index()),
                    );
                }
            }
        });

        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        tasks.insert(
            id,
            TaskHandle {
                cancel,
                _handle: handle,
            },
        );
    }

    /// Stops one timer loop. In-flight ticks are not interrupted.
    ///
    /// Returns `false` if the id was unknown. Idempotent.
    pub fn stop(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            tasks.remove(&id)
        };
        match removed {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every timer loop (engine shutdown).
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        for (_, task) in tasks.drain() {
            task.cancel.cancel();
        }
    }

    /// Number of live timer loops.
    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn initial_jitter(period: Duration) -> Duration {
    let span = (period.as_millis() as u64).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..span))
}

/// Everything one tick needs, cloned into each dispatched job.
#[derive(Clone)]
struct TickContext {
    id: SubscriptionId,
    key: VehicleKey,
    role: Role,
    channel: Arc<dyn PushChannel>,
    state: Arc<Mutex<SubscriptionState>>,
    store: Arc<dyn StatusStore>,
    gate: Arc<ChangeGate>,
    bus: Bus,
    stop: CancellationToken,
    short: u32,
    extended: u32,
}

impl TickContext {
    /// One fallback tick: resolve, transition, act.
    async fn run(self) {
        let record = match self.store.find_latest(&self.key).await {
            Ok(record) => record,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        let outcome = if record.is_some() {
            TickOutcome::Resolved
        } else {
            TickOutcome::Absent
        };
        let action = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.advance(outcome, self.short, self.extended)
        };

        match action {
            TickAction::Deliver => {
                if let Some(record) = record {
                    self.deliver(&record).await;
                }
            }
            TickAction::Wait { retries, limit } => {
                self.bus.publish(
                    Event::now(EventKind::VehicleUnseen)
                        .with_key(Arc::clone(&self.key))
                        .with_subscription(self.id)
                        .with_retries(retries, limit),
                );
            }
            TickAction::CompleteNormally { retries, limit } => {
                self.bus.publish(
                    Event::now(EventKind::StreamCompleted)
                        .with_key(Arc::clone(&self.key))
                        .with_subscription(self.id)
                        .with_retries(retries, limit),
                );
                self.channel.complete();
                self.stop.cancel();
            }
            TickAction::None => {}
        }
    }

    /// Push one resolved record through the gate.
    async fn deliver(&self, record: &StatusRecord) {
        let view = project(record, self.role);
        let decision = self.gate.decide(&self.key, self.role, &view);
        if decision != GateDecision::Send {
            self.bus.publish(
                Event::now(EventKind::PushSkipped)
                    .with_key(Arc::clone(&self.key))
                    .with_role(self.role)
                    .with_reason(decision.as_label()),
            );
            return;
        }

        match self.channel.send(&view).await {
            Ok(()) => {
                self.gate.record(&self.key, self.role, view);
                self.bus.publish(
                    Event::now(EventKind::PushDelivered)
                        .with_key(Arc::clone(&self.key))
                        .with_role(self.role)
                        .with_subscription(self.id),
                );
            }
            Err(err @ ChannelError::Full) => {
                self.bus.publish(
                    Event::now(EventKind::PushSkipped)
                        .with_key(Arc::clone(&self.key))
                        .with_role(self.role)
                        .with_reason(err.as_label()),
                );
            }
            // Channel already settled; the close watcher cleans up.
            Err(ChannelError::Closed) => {}
        }
    }

    /// Unexpected tick failure: close with error and stop the loop.
    fn fail(&self, err: StreamError) {
        self.bus.publish(
            Event::now(EventKind::StreamFailed)
                .with_key(Arc::clone(&self.key))
                .with_subscription(self.id)
                .with_reason(err.to_string()),
        );
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.close();
        }
        self.channel.complete_with_error(StreamError::Tick {
            reason: err.to_string().into(),
        });
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CloseReason, LocalChannel};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::SystemTime;

    use crate::engine::pool::WorkerPool;

    fn test_cfg() -> Config {
        Config {
            fallback_period: Duration::from_secs(1),
            max_retry_new: 3,
            max_retry_seen: 5,
            min_push_interval: Duration::from_millis(100),
            channel_timeout: Duration::from_secs(3600),
            ..Config::default()
        }
    }

    fn engine_parts(cfg: &Config) -> (Arc<MemoryStore>, Arc<ChangeGate>, Bus, WorkerPool, FallbackScheduler) {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(ChangeGate::new(cfg.min_push_interval));
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let pool = WorkerPool::new(cfg, bus.clone());
        let scheduler = FallbackScheduler::new(
            cfg,
            Arc::clone(&store) as Arc<dyn StatusStore>,
            Arc::clone(&gate),
            bus.clone(),
        );
        (store, gate, bus, pool, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_a_stored_record_within_one_period() {
        let cfg = test_cfg();
        let (store, _gate, _bus, pool, scheduler) = engine_parts(&cfg);
        store
            .save(StatusRecord::new("V2", SystemTime::UNIX_EPOCH))
            .await
            .unwrap();

        let (channel, mut rx) = LocalChannel::open(cfg.channel_timeout);
        let worker = pool.register(1);
        scheduler.start(1, VehicleKey::from("V2"), Role::Full, channel, worker);

        let view = rx.recv().await.expect("fallback tick should deliver");
        assert_eq!(&*view.key, "V2");
        scheduler.stop_all();
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn never_seen_key_completes_normally_after_threshold() {
        let cfg = test_cfg();
        let (_store, _gate, bus, pool, scheduler) = engine_parts(&cfg);
        let mut events = bus.subscribe();

        let (channel, rx) = LocalChannel::open(cfg.channel_timeout);
        let worker = pool.register(7);
        scheduler.start(7, VehicleKey::from("V1"), Role::Base, channel, worker);

        assert_eq!(rx.closed().await, CloseReason::Completed);

        let mut unseen = 0;
        let mut completed = false;
        while let Ok(ev) = events.try_recv() {
            match ev.kind {
                EventKind::VehicleUnseen => unseen += 1,
                EventKind::StreamCompleted => {
                    completed = true;
                    assert_eq!(ev.retries, Some(cfg.max_retry_new + 1));
                    assert_eq!(ev.retry_limit, Some(cfg.max_retry_new));
                }
                _ => {}
            }
        }
        assert_eq!(unseen, cfg.max_retry_new);
        assert!(completed);
        scheduler.stop_all();
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_record_is_pushed_once() {
        let cfg = test_cfg();
        let (store, _gate, _bus, pool, scheduler) = engine_parts(&cfg);
        store
            .save(StatusRecord::new("V3", SystemTime::UNIX_EPOCH))
            .await
            .unwrap();

        let (channel, mut rx) = LocalChannel::open(cfg.channel_timeout);
        let worker = pool.register(3);
        scheduler.start(3, VehicleKey::from("V3"), Role::Full, channel, worker);

        assert!(rx.recv().await.is_some());
        // Several more periods pass; the unchanged view is withheld.
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(second.is_err());
        scheduler.stop_all();
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_worker_queue_skips_ticks_without_advancing_retries() {
        let cfg = Config {
            worker_queue_capacity: 1,
            ..test_cfg()
        };
        let (_store, _gate, bus, pool, scheduler) = engine_parts(&cfg);
        let mut events = bus.subscribe();

        // Stall the worker on one job and fill its queue of one with another.
        let worker = pool.register(11);
        let hold = CancellationToken::new();
        let first = hold.clone();
        assert!(worker.try_dispatch(async move { first.cancelled().await }.boxed()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = hold.clone();
        assert!(worker.try_dispatch(async move { second.cancelled().await }.boxed()));

        let (channel, _rx) = LocalChannel::open(cfg.channel_timeout);
        scheduler.start(11, VehicleKey::from("V11"), Role::Base, channel, worker);

        // Ticks fire but none can be enqueued; each one is reported and
        // dropped without touching the absent counter.
        let mut overflows = 0;
        while overflows < 3 {
            let ev = events.recv().await.unwrap();
            assert_ne!(ev.kind, EventKind::VehicleUnseen);
            if ev.kind == EventKind::TickOverflow {
                assert_eq!(ev.subscription, Some(11));
                overflows += 1;
            }
        }

        // Unblock the worker: the first tick that actually runs starts the
        // absent streak at one, as if the skipped ticks never happened.
        hold.cancel();
        let ev = loop {
            let ev = events.recv().await.unwrap();
            if ev.kind == EventKind::VehicleUnseen {
                break ev;
            }
        };
        assert_eq!(ev.retries, Some(1));
        assert_eq!(ev.retry_limit, Some(cfg.max_retry_new));

        scheduler.stop_all();
        pool.shutdown().await;
    }

    struct BrokenStore;

    #[async_trait]
    impl StatusStore for BrokenStore {
        async fn find_latest(&self, _key: &str) -> Result<Option<StatusRecord>, StreamError> {
            Err(StreamError::Store {
                reason: "connection refused".into(),
            })
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
    async fn store_failure_closes_the_channel_with_error() {
        let cfg = test_cfg();
        let gate = Arc::new(ChangeGate::new(cfg.min_push_interval));
        let bus = Bus::new(64);
        let pool = WorkerPool::new(&cfg, bus.clone());
        let scheduler = FallbackScheduler::new(&cfg, Arc::new(BrokenStore), gate, bus);

        let (channel, rx) = LocalChannel::open(cfg.channel_timeout);
        let worker = pool.register(9);
        scheduler.start(9, VehicleKey::from("V9"), Role::Base, channel, worker);

        assert_eq!(rx.closed().await, CloseReason::Error);
        assert!(matches!(rx.close_error(), Some(StreamError::Tick { .. })));
        scheduler.stop_all();
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_counts_drop() {
        let cfg = test_cfg();
        let (_store, _gate, _bus, pool, scheduler) = engine_parts(&cfg);
        let (channel, _rx) = LocalChannel::open(cfg.channel_timeout);
        let worker = pool.register(4);
        scheduler.start(4, VehicleKey::from("V4"), Role::Base, channel, worker);
        assert_eq!(scheduler.len(), 1);

        assert!(scheduler.stop(4));
        assert!(!scheduler.stop(4));
        assert!(scheduler.is_empty());
        pool.shutdown().await;
    }
}
