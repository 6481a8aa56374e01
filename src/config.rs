//! # Engine configuration.
//!
//! [`Config`] centralizes every tuning knob of the delivery engine: worker
//! pool sizing, fallback cadence, retry thresholds, push throttling, and
//! channel lifetime. All values are static at startup.
//!
//! Config is consumed in two places:
//! 1. **Engine construction**: `StreamManager::new(store, config)`
//! 2. **Channel construction**: `LocalChannel::open(cfg.channel_timeout)`

use std::time::Duration;

/// Static configuration for the delivery engine.
///
/// ## Field semantics
/// - Pool sizing: `initial_pool <= max_pool`, `min_pool >= 1`; the pool never
///   shrinks below `min_pool` and slot 0 is never retired.
/// - `streams_per_worker` is the per-slot load at which the pool grows.
/// - `fallback_period` is the fixed cadence of per-subscription re-checks.
/// - `max_retry_new` / `max_retry_seen` bound how many consecutive absent
///   ticks a never-seen / previously-seen vehicle gets before its channel
///   completes.
/// - `min_push_interval` bounds push frequency per (key, role) even under
///   bursty writes.
#[derive(Clone, Debug)]
pub struct Config {
    /// Worker slots created up front.
    pub initial_pool: usize,

    /// Hard cap on worker slots; the arena is allocated at this size.
    pub max_pool: usize,

    /// Floor for shrinking; at least one worker always survives.
    pub min_pool: usize,

    /// Subscriptions per worker before the pool grows by one slot.
    pub streams_per_worker: usize,

    /// Period of the per-subscription fallback re-check.
    pub fallback_period: Duration,

    /// Absent-tick limit for a vehicle that has never resolved.
    ///
    /// 30 attempts at the default 30 s period ≈ 15 minutes: long enough for
    /// onboarding lag, short enough to fail a typo quickly.
    pub max_retry_new: u32,

    /// Absent-tick limit for a vehicle that resolved at least once.
    ///
    /// 180 attempts ≈ 90 minutes: a previously-seen vehicle is more likely
    /// in a connectivity gap than gone, so be patient.
    pub max_retry_seen: u32,

    /// Minimum interval between pushes for one (key, role) pair.
    pub min_push_interval: Duration,

    /// Overall lifetime of a delivery channel before it times out.
    pub channel_timeout: Duration,

    /// Capacity of the event bus broadcast ring buffer.
    ///
    /// Slow subscribers that lag more than this many events skip the oldest
    /// ones. Minimum value is 1 (clamped by the bus).
    pub bus_capacity: usize,

    /// Capacity of each worker's tick-job queue.
    ///
    /// When full, a fallback tick is skipped (and reported), not queued
    /// unboundedly.
    pub worker_queue_capacity: usize,

    /// Bounded wait for a retired worker to drain before force-stop.
    pub retire_grace: Duration,
}

impl Config {
    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Worker queue capacity clamped to a minimum of 1.
    #[inline]
    pub fn worker_queue_clamped(&self) -> usize {
        self.worker_queue_capacity.max(1)
    }

    /// Initial pool size clamped into `min_pool..=max_pool`.
    #[inline]
    pub fn initial_pool_clamped(&self) -> usize {
        self.initial_pool.clamp(self.min_pool.max(1), self.max_pool)
    }

    /// Fallback period clamped to a minimum of one millisecond.
    ///
    /// A zero period would make the tick timer spin (and `tokio::time::interval`
    /// rejects it outright).
    #[inline]
    pub fn fallback_period_clamped(&self) -> Duration {
        self.fallback_period.max(Duration::from_millis(1))
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `initial_pool = 2`, `max_pool = 8`, `min_pool = 1`
    /// - `streams_per_worker = 10`
    /// - `fallback_period = 30s`
    /// - `max_retry_new = 30` (≈ 15 min), `max_retry_seen = 180` (≈ 90 min)
    /// - `min_push_interval = 1s`
    /// - `channel_timeout = 300s`
    /// - `bus_capacity = 1024`, `worker_queue_capacity = 32`
    /// - `retire_grace = 5s`
    fn default() -> Self {
        Self {
            initial_pool: 2,
            max_pool: 8,
            min_pool: 1,
            streams_per_worker: 10,
            fallback_period: Duration::from_secs(30),
            max_retry_new: 30,
            max_retry_seen: 180,
            min_push_interval: Duration::from_secs(1),
            channel_timeout: Duration::from_secs(300),
            bus_capacity: 1024,
            worker_queue_capacity: 32,
            retire_grace: Duration::from_secs(5),
        }
    }
}
