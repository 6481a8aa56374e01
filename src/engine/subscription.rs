//! # Per-subscription delivery state.
//!
//! One [`SubscriptionState`] exists per live subscription and is advanced by
//! the fallback scheduler through [`SubscriptionState::advance`], one
//! transition per tick.
//!
//! ## State machine
//! ```text
//!  Starting ──resolved──► Active ◄──resolved──┐
//!     │                      │                │
//!   absent                 absent             │
//!     ▼                      ▼                │
//!  RetryingShort        RetryingExtended ─────┘
//!     │ retries > short      │ retries > extended
//!     └──────────► Closed ◄──┘
//! ```
//!
//! ## Rules
//! - `retries_since_last_seen` resets to zero on every resolved read.
//! - `ever_seen` is monotone: false → true, never back.
//! - A never-seen key gets the **short** threshold (likely a typo or a
//!   not-yet-onboarded vehicle: fail fast); a previously-seen key gets the
//!   **extended** one (likely a connectivity gap: be patient).
//! - Exhausting either threshold closes the stream **normally** — the
//!   vehicle simply never (re)appeared; that is not an error.

/// Unique identifier of one live subscription.
pub type SubscriptionId = u64;

/// Phase of a subscription's fallback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// No tick has resolved the key yet.
    Starting,
    /// The latest tick resolved the key.
    Active,
    /// Key absent and never seen; counting toward the short threshold.
    RetryingShort,
    /// Key absent after having been seen; counting toward the extended one.
    RetryingExtended,
    /// Terminal. No further ticks have any effect.
    Closed,
}

/// What a fallback tick found in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A record exists for the key.
    Resolved,
    /// No record for the key.
    Absent,
}

/// What the scheduler must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Key resolved: project, consult the gate, push if allowed.
    Deliver,
    /// Below threshold: stay quiet until the next tick.
    Wait {
        /// Consecutive absent ticks so far.
        retries: u32,
        /// Threshold currently in effect.
        limit: u32,
    },
    /// Threshold exhausted: complete the channel normally and stop.
    CompleteNormally {
        /// Absent ticks accumulated when giving up.
        retries: u32,
        /// Threshold that was exhausted.
        limit: u32,
    },
    /// Already closed: do nothing.
    None,
}

/// Mutable per-subscription delivery state.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    /// Current phase.
    pub phase: SubscriptionPhase,
    /// Consecutive ticks for which the key did not resolve.
    pub retries_since_last_seen: u32,
    /// Whether the key has ever resolved for this subscription.
    pub ever_seen: bool,
}

impl SubscriptionState {
    /// Fresh state for a just-accepted subscription.
    pub fn new() -> Self {
        Self {
            phase: SubscriptionPhase::Starting,
            retries_since_last_seen: 0,
            ever_seen: false,
        }
    }

    /// Advances the machine with one tick's outcome.
    ///
    /// `short` and `extended` are the configured absent-tick thresholds for
    /// never-seen and previously-seen keys respectively.
    pub fn advance(&mut self, outcome: TickOutcome, short: u32, extended: u32) -> TickAction {
        if self.phase == SubscriptionPhase::Closed {
            return TickAction::None;
        }

        match outcome {
            TickOutcome::Resolved => {
                self.retries_since_last_seen = 0;
                self.ever_seen = true;
                self.phase = SubscriptionPhase::Active;
                TickAction::Deliver
            }
            TickOutcome::Absent => {
                self.retries_since_last_seen += 1;
                let limit = if self.ever_seen { extended } else { short };

                if self.retries_since_last_seen > limit {
                    self.phase = SubscriptionPhase::Closed;
                    TickAction::CompleteNormally {
                        retries: self.retries_since_last_seen,
                        limit,
                    }
                } else {
                    self.phase = if self.ever_seen {
                        SubscriptionPhase::RetryingExtended
                    } else {
                        SubscriptionPhase::RetryingShort
                    };
                    TickAction::Wait {
                        retries: self.retries_since_last_seen,
                        limit,
                    }
                }
            }
        }
    }

    /// Forces the terminal phase (error teardown or explicit cancellation).
    pub fn close(&mut self) {
        self.phase = SubscriptionPhase::Closed;
    }

    /// True once the machine reached its terminal phase.
    pub fn is_closed(&self) -> bool {
        self.phase == SubscriptionPhase::Closed
    }
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self::new()
    }
}
