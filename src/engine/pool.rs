//! # Worker pool: a fixed arena of tick workers with an atomic live size.
//!
//! The arena holds `max_pool` slots; only indexes `0..size` are live. Each
//! live slot runs one tokio task draining a bounded queue of boxed tick
//! jobs, so ticks for many subscriptions share a small number of tasks.
//!
//! ```text
//!  slots: [ w0 ][ w1 ][ w2 ][ -- ][ -- ] ... [ -- ]
//!           ▲            ▲    ▲
//!           │            │    └ first dead slot (index == size)
//!   never retired        └ tail: only candidate for shrink
//! ```
//!
//! ## Rules
//! - **Load is derived, never stored.** A slot's load is the number of
//!   subscriptions currently registered to it, counted from the registration
//!   map on demand.
//! - **Growth** happens when every live slot is at `streams_per_worker`:
//!   one CAS bumps the size, the winner activates the new tail slot and
//!   takes it; a concurrent loser falls back to slot 0.
//! - **Shrink** retires the tail slot only, only when its load is zero and
//!   `size > min_pool`. Retirement is graceful: intake stops, queued jobs
//!   drain, and the task is force-stopped after `retire_grace`.
//! - Slot 0 is live for the pool's whole lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::subscription::SubscriptionId;
use crate::events::{Bus, Event, EventKind};

/// A unit of work executed on a worker slot.
pub type TickJob = BoxFuture<'static, ()>;

/// Handle to the worker slot a subscription was placed on.
///
/// Cheap to clone; dispatching does not touch the pool's locks.
#[derive(Clone)]
pub struct WorkerRef {
    index: usize,
    jobs: mpsc::Sender<TickJob>,
}

impl WorkerRef {
    /// Index of the slot this handle points at.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueues a job without waiting.
    ///
    /// `false` means the queue was full or the worker is retiring; the
    /// caller skips this tick and reports it.
    pub fn try_dispatch(&self, job: TickJob) -> bool {
        self.jobs.try_send(job).is_ok()
    }
}

struct Worker {
    jobs: mpsc::Sender<TickJob>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Slot {
    worker: Mutex<Option<Worker>>,
}

/// Fixed-arena pool of tick workers.
pub struct WorkerPool {
    slots: Vec<Slot>,
    size: AtomicUsize,
    streams_per_worker: usize,
    min_pool: usize,
    queue_capacity: usize,
    retire_grace: Duration,
    registrations: RwLock<HashMap<SubscriptionId, usize>>,
    bus: Bus,
}

impl WorkerPool {
    /// Creates the pool with `initial_pool` live workers.
    ///
    /// Must be called within a tokio runtime: each live slot spawns its
    /// worker task immediately.
    pub fn new(cfg: &Config, bus: Bus) -> Self {
        let max = cfg.max_pool.max(1);
        let initial = cfg.initial_pool_clamped();

        let pool = Self {
            slots: (0..max)
                .map(|_| Slot {
                    worker: Mutex::new(None),
                })
                .collect(),
            size: AtomicUsize::new(initial),
            streams_per_worker: cfg.streams_per_worker.max(1),
            min_pool: cfg.min_pool.max(1),
            queue_capacity: cfg.worker_queue_clamped(),
            retire_grace: cfg.retire_grace,
            registrations: RwLock::new(HashMap::new()),
            bus,
        };
        for index in 0..initial {
            pool.activate(index);
        }
        pool
    }

    /// Places a subscription on a worker and records the registration.
    pub fn register(&self, id: SubscriptionId) -> WorkerRef {
        let index = self.select_index();
        // A tail selected just before it was retired falls back to slot 0;
        // a registration after shutdown revives slot 0.
        let mut worker = self
            .ref_at(index)
            .or_else(|| self.ref_at(0))
            .unwrap_or_else(|| self.revive_slot_zero());

        {
            let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
            regs.insert(id, worker.index);
        }

        // The slot can be retired between selection and the insert above:
        // the shrink path rechecks the map after its CAS, and this recheck
        // covers the opposite ordering. Between the two, a registration
        // never stays mapped to a dead or out-of-range slot.
        if worker.index >= self.size() || !self.slot_is_live(worker.index) {
            worker = self
                .ref_at(0)
                .unwrap_or_else(|| self.revive_slot_zero());
            let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
            regs.insert(id, worker.index);
        }
        worker
    }

    /// Removes a subscription's registration and shrinks the tail if idle.
    pub fn unregister(&self, id: SubscriptionId) {
        let removed = {
            let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
            regs.remove(&id).is_some()
        };
        if removed {
            self.maybe_shrink();
        }
    }

    /// Current number of live workers.
    pub fn size(&self) -> usize {
        self.size.load(AtomicOrdering::Acquire)
    }

    /// Registered subscriptions per live slot, index-aligned.
    pub fn loads(&self) -> Vec<usize> {
        let size = self.size();
        let mut loads = vec![0usize; size];
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        for &index in regs.values() {
            if index < size {
                loads[index] += 1;
            }
        }
        loads
    }

    /// Total registered subscriptions.
    pub fn registered(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Retires every worker. Queued jobs drain within `retire_grace` each.
    pub async fn shutdown(&self) {
        let size = self.size.swap(0, AtomicOrdering::AcqRel);
        for index in 0..size {
            if let Some(worker) = self.take_worker(index) {
                retire(worker, self.retire_grace).await;
            }
        }
        let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        regs.clear();
    }

    /// Least-loaded placement with CAS growth at the per-worker threshold.
    fn select_index(&self) -> usize {
        let size = self.size();
        let loads = self.loads();
        let (best, best_load) = loads
            .iter()
            .copied()
            .enumerate()
            .take(size)
            .min_by_key(|&(_, load)| load)
            .unwrap_or((0, 0));

        if best_load < self.streams_per_worker || size >= self.slots.len() {
            return best;
        }

        // Every live slot is saturated; try to claim the next one.
        match self.size.compare_exchange(
            size,
            size + 1,
            AtomicOrdering::AcqRel,
            AtomicOrdering::Acquire,
        ) {
            Ok(_) => {
                self.activate(size);
                self.bus
                    .publish(Event::now(EventKind::PoolGrew).with_worker(size));
                size
            }
            // Another caller grew (or shrank) first; everyone who lost the
            // race lands on slot 0.
            Err(_) => 0,
        }
    }

    /// Retires the tail while its load is zero and the floor allows.
    fn maybe_shrink(&self) {
        loop {
            let size = self.size();
            if size <= self.min_pool {
                return;
            }
            let tail = size - 1;
            if self.slot_load(tail) != 0 {
                return;
            }
            if self
                .size
                .compare_exchange(size, tail, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                .is_err()
            {
                continue;
            }

            // A registration may have landed on the tail between the load
            // check and the CAS. Put the size back instead of retiring a
            // slot that just became busy.
            if self.slot_load(tail) != 0 {
                let _ = self.size.compare_exchange(
                    tail,
                    size,
                    AtomicOrdering::AcqRel,
                    AtomicOrdering::Acquire,
                );
                return;
            }

            if let Some(worker) = self.take_worker(tail) {
                let grace = self.retire_grace;
                tokio::spawn(async move {
                    retire(worker, grace).await;
                });
            }
            self.bus
                .publish(Event::now(EventKind::PoolShrank).with_worker(tail));
        }
    }

    /// Spawns the worker task for one slot.
    fn activate(&self, index: usize) -> WorkerRef {
        let (tx, mut rx) = mpsc::channel::<TickJob>(self.queue_capacity);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => job.await,
                        None => break,
                    },
                    _ = stop.cancelled() => break,
                }
            }
        });

        let worker_ref = WorkerRef {
            index,
            jobs: tx.clone(),
        };
        let mut slot = self.slots[index]
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Worker {
            jobs: tx,
            cancel,
            handle,
        });
        worker_ref
    }

    fn ref_at(&self, index: usize) -> Option<WorkerRef> {
        let slot = self.slots[index]
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|w| WorkerRef {
            index,
            jobs: w.jobs.clone(),
        })
    }

    fn take_worker(&self, index: usize) -> Option<Worker> {
        let mut slot = self.slots[index]
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        slot.take()
    }

    /// Registrations mapped to one slot, live or not.
    fn slot_load(&self, index: usize) -> usize {
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        regs.values().filter(|&&slot| slot == index).count()
    }

    fn slot_is_live(&self, index: usize) -> bool {
        let slot = self.slots[index]
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        slot.is_some()
    }

    /// Brings slot 0 back as the only live worker after a full stop.
    fn revive_slot_zero(&self) -> WorkerRef {
        let worker = self.activate(0);
        let _ = self
            .size
            .compare_exchange(0, 1, AtomicOrdering::AcqRel, AtomicOrdering::Acquire);
        worker
    }
}

/// Stops intake, drains queued jobs, force-stops after the grace period.
async fn retire(worker: Worker, grace: Duration) {
    let Worker {
        jobs,
        cancel,
        mut handle,
    } = worker;

    // Dropping the sender lets the task finish whatever is queued and exit.
    drop(jobs);
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        cancel.cancel();
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;

    fn pool_with(initial: usize, max: usize, per_worker: usize) -> WorkerPool {
        let cfg = Config {
            initial_pool: initial,
            max_pool: max,
            streams_per_worker: per_worker,
            ..Config::default()
        };
        WorkerPool::new(&cfg, Bus::new(64))
    }

    #[tokio::test]
    async fn starts_at_initial_size() {
        let pool = pool_with(2, 8, 10);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.loads(), vec![0, 0]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn placement_prefers_the_least_loaded_slot() {
        let pool = pool_with(2, 8, 10);
        let a = pool.register(1);
        let b = pool.register(2);
        assert_ne!(a.index(), b.index());
        assert_eq!(pool.loads(), vec![1, 1]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn grows_when_every_slot_is_saturated() {
        let pool = pool_with(2, 8, 10);
        for id in 0..20 {
            pool.register(id);
        }
        assert_eq!(pool.size(), 2);

        // 21st subscription: both slots at 10, pool grows to 3.
        let w = pool.register(20);
        assert_eq!(pool.size(), 3);
        assert_eq!(w.index(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn twenty_five_subscriptions_land_on_three_workers() {
        let pool = pool_with(2, 8, 10);
        for id in 0..25 {
            pool.register(id);
        }
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.loads().iter().sum::<usize>(), 25);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn never_grows_past_the_arena() {
        let pool = pool_with(1, 2, 1);
        for id in 0..10 {
            pool.register(id);
        }
        assert_eq!(pool.size(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shrinks_tail_but_not_below_the_floor() {
        let pool = pool_with(2, 8, 1);
        pool.register(1);
        pool.register(2);
        let tail = pool.register(3);
        assert_eq!(pool.size(), 3);
        assert_eq!(tail.index(), 2);

        pool.unregister(3);
        assert_eq!(pool.size(), 2);

        pool.unregister(1);
        pool.unregister(2);
        // min_pool is 1: one worker survives with zero load.
        assert_eq!(pool.size(), 1);
        pool.unregister(999);
        assert_eq!(pool.size(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shrink_waits_for_the_tail_to_empty() {
        let pool = pool_with(2, 8, 10);
        for id in 0..25 {
            pool.register(id);
        }
        assert_eq!(pool.size(), 3);

        // Down to 5 subscriptions, but the tail slot still carries load.
        for id in 0..20 {
            pool.unregister(id);
        }
        assert_eq!(pool.registered(), 5);
        assert_eq!(pool.size(), 3);

        // Emptying the tail is what triggers the shrink.
        for id in 20..25 {
            pool.unregister(id);
        }
        assert!(pool.size() < 3);
        assert!(pool.size() >= 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn tail_with_load_is_not_retired() {
        let pool = pool_with(2, 8, 1);
        pool.register(1);
        pool.register(2);
        pool.register(3);
        assert_eq!(pool.size(), 3);

        // Tail still carries subscription 3.
        pool.unregister(1);
        assert_eq!(pool.size(), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dispatched_jobs_run_on_the_worker() {
        let pool = pool_with(1, 1, 10);
        let worker = pool.register(1);
        let (tx, rx) = tokio::sync::oneshot::channel();

        assert!(worker.try_dispatch(
            async move {
                let _ = tx.send(42u32);
            }
            .boxed()
        ));
        assert_eq!(rx.await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let pool = pool_with(1, 1, 10);
        let worker = pool.register(1);
        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(worker.try_dispatch(
            async move {
                let _ = tx.send(());
            }
            .boxed()
        ));

        pool.shutdown().await;
        assert!(rx.await.is_ok());
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.registered(), 0);
    }

    #[tokio::test]
    async fn registration_after_shutdown_revives_slot_zero() {
        let pool = pool_with(2, 8, 10);
        pool.shutdown().await;
        assert_eq!(pool.size(), 0);

        // A late registration gets a live worker and the size follows it,
        // so load accounting stays in step with the registration count.
        let worker = pool.register(1);
        assert_eq!(worker.index(), 0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.loads(), vec![1]);
        assert_eq!(pool.registered(), 1);

        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(worker.try_dispatch(
            async move {
                let _ = tx.send(());
            }
            .boxed()
        ));
        assert!(rx.await.is_ok());
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churn_keeps_loads_in_step_with_registrations() {
        let pool = Arc::new(pool_with(2, 8, 1));

        let mut tasks = Vec::new();
        for t in 0..4u64 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for i in 0..200u64 {
                    let id = t * 1_000 + i;
                    pool.register(id);
                    if i % 2 == 0 {
                        pool.unregister(id);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Odd ids stay registered: 100 per task. Every one of them must be
        // mapped to a live slot, so the per-slot loads sum to the total.
        assert_eq!(pool.registered(), 400);
        assert_eq!(pool.loads().iter().sum::<usize>(), 400);
        assert!(pool.size() >= 1 && pool.size() <= 8);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn growth_publishes_a_pool_event() {
        let cfg = Config {
            initial_pool: 1,
            max_pool: 2,
            streams_per_worker: 1,
            ..Config::default()
        };
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let pool = WorkerPool::new(&cfg, bus);

        pool.register(1);
        pool.register(2);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::PoolGrew);
        assert_eq!(ev.worker, Some(1));
        pool.shutdown().await;
    }
}
