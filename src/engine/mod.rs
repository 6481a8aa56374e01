//! The live-delivery engine: change gate, worker pool, fallback scheduler,
//! and the subscription lifecycle manager that orchestrates them.

mod gate;
mod manager;
mod pool;
mod scheduler;
mod subscription;

pub use gate::{ChangeGate, GateDecision};
pub use manager::{EngineStats, StreamManager};
pub use pool::{TickJob, WorkerPool, WorkerRef};
pub use scheduler::FallbackScheduler;
pub use subscription::{SubscriptionId, SubscriptionPhase, SubscriptionState, TickAction, TickOutcome};
