//! Dependency-aware build orchestration.
//!
//! A [`Plan`] of phases and tasks is resolved into a two-level dependency
//! graph, then driven by an [`Engine`] under bounded concurrency. Every
//! state change goes through one state machine, is published on an event
//! bus and is periodically checkpointed so an interrupted run can resume.

pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod plan;
pub mod recovery;
pub mod state;
pub mod ui;

pub use config::RunConfig;
pub use engine::{
    Engine, ExecutionContext, ExecutionOutcome, RunHandle, RunReport, RunStatus, TaskExecutor,
    UnitDescriptor,
};
pub use errors::{CheckpointError, EngineError, GraphValidationError, TransitionError};
pub use events::{Event, EventBus, EventStream};
pub use plan::{PhaseSpec, Plan, TaskSpec};
pub use state::{ErrorCategory, UnitError, UnitId, UnitState};
