//! Per-unit lifecycle tracking.
//!
//! ```text
//! Pending -> Ready -> Running -> Completed
//!                        |
//!                        v
//!                     Failed -> Retrying -> Ready
//!                        |
//!                        +-> Skipped | Aborted
//! ```
//!
//! `Cascade` moves a unit that can no longer run straight to `Skipped`, and
//! `Interrupt` returns an in-flight unit to `Pending` when a run halts.

mod machine;
mod unit;

pub use machine::{ExecutionState, StateCounts, StateMachine};
pub use unit::{
    ErrorCategory, Transition, TransitionEvent, UnitError, UnitId, UnitKind, UnitRecord,
    UnitState,
};
