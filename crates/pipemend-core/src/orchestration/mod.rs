//! Orchestration loop: state machine, backoff and the driver.

pub mod backoff;
pub mod engine;
pub mod state;

pub use backoff::BackoffPolicy;
pub use engine::{HealingLoop, LoopSettings};
pub use state::{
    AttemptRecord, LoopIssue, LoopOutcome, LoopPhase, LoopState, Transition, UnrecoverableReason,
};
