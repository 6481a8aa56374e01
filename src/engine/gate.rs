//! # Change gate: decides whether a candidate view is worth pushing.
//!
//! Per (vehicle key, role) pair the gate remembers the last delivered view
//! and when it was sent. A candidate passes only if the pair is not inside
//! its throttle window **and** the content actually changed (or nothing was
//! ever delivered).
//!
//! ## Policy, in order
//! 1. Sent less than `min_interval` ago → deny, regardless of content.
//!    Bounds push frequency even under bursty writes.
//! 2. No prior entry → allow (first delivery always happens).
//! 3. Allow iff the candidate differs structurally from the last view.
//!
//! ## Rules
//! - **Decide and commit are separate.** An allowed decision changes
//!   nothing; the caller calls [`ChangeGate::record`] only after the push
//!   actually succeeded. A failed push therefore never marks success.
//! - **No cross-key locking.** The map lock is held only to look up or
//!   create an entry; each entry updates under its own lock, so concurrent
//!   subscriptions on different pairs never contend.
//!
//! Time is read through [`tokio::time::Instant`] so throttle behavior is
//! testable under a paused clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::model::{ProjectedView, Role, VehicleKey};

/// Outcome of a gate consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Push it, then commit with [`ChangeGate::record`].
    Send,
    /// Inside the minimum push interval.
    Throttled,
    /// Structurally identical to the last delivered view.
    Unchanged,
}

impl GateDecision {
    /// Stable label for skip events.
    pub fn as_label(self) -> &'static str {
        match self {
            GateDecision::Send => "send",
            GateDecision::Throttled => "throttled",
            GateDecision::Unchanged => "unchanged",
        }
    }
}

struct GateEntry {
    last_view: ProjectedView,
    last_sent_at: Instant,
}

/// Throttling and deduplication cache for delivered views.
pub struct ChangeGate {
    min_interval: Duration,
    entries: RwLock<HashMap<(VehicleKey, Role), Arc<Mutex<GateEntry>>>>,
}

impl ChangeGate {
    /// Creates a gate with the given minimum push interval.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Full decision for a candidate view.
    pub fn decide(&self, key: &VehicleKey, role: Role, candidate: &ProjectedView) -> GateDecision {
        let entry = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.get(&(key.clone(), role)).cloned()
        };
        let Some(entry) = entry else {
            return GateDecision::Send;
        };

        let entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        if entry.last_sent_at.elapsed() < self.min_interval {
            GateDecision::Throttled
        } else if *candidate == entry.last_view {
            GateDecision::Unchanged
        } else {
            GateDecision::Send
        }
    }

    /// True if the candidate should be pushed now.
    pub fn should_send(&self, key: &VehicleKey, role: Role, candidate: &ProjectedView) -> bool {
        self.decide(key, role, candidate) == GateDecision::Send
    }

    /// Commits a successful delivery: remembers the view and the send time.
    pub fn record(&self, key: &VehicleKey, role: Role, view: ProjectedView) {
        let now = Instant::now();
        let entry = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.get(&(key.clone(), role)).cloned()
        };
        match entry {
            Some(entry) => {
                let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
                entry.last_view = view;
                entry.last_sent_at = now;
            }
            None => {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries
                    .entry((key.clone(), role))
                    .and_modify(|slot| {
                        let mut entry = slot.lock().unwrap_or_else(|e| e.into_inner());
                        entry.last_view = view.clone();
                        entry.last_sent_at = now;
                    })
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(GateEntry {
                            last_view: view,
                            last_sent_at: now,
                        }))
                    });
            }
        }
    }

    /// Drops the entry for one (key, role) pair.
    pub fn clear(&self, key: &VehicleKey, role: Role) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(key.clone(), role));
    }

    /// Drops every entry (engine shutdown).
    pub fn clear_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Number of tracked (key, role) pairs, for monitoring.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
