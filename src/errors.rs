//! Typed error hierarchy for the stagehand engine.
//!
//! Four enums cover the four failure domains:
//! - `GraphValidationError`: plan/graph problems detected before a run starts
//! - `TransitionError`: a lifecycle edge that does not exist (internal bug)
//! - `CheckpointError`: storage and encoding failures around checkpoints
//! - `EngineError`: everything that can reach the caller of a run

use crate::state::{TransitionEvent, UnitState};
use thiserror::Error;

/// Problems with the shape of a plan. Always fatal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Unknown dependency '{dependency}' in unit '{unit}': no unit with that id exists")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Unit '{unit}' depends on itself")]
    SelfDependency { unit: String },

    #[error("Duplicate unit id: {unit}")]
    DuplicateUnit { unit: String },

    #[error("Unit ids must not be empty (position {position})")]
    EmptyId { position: usize },

    #[error("Phase id '{phase}' must not contain '.'")]
    InvalidPhaseId { phase: String },
}

/// A lifecycle event that has no edge from the unit's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition for unit {unit}: {event:?} is not allowed from {from}")]
    InvalidTransition {
        unit: String,
        from: UnitState,
        event: TransitionEvent,
    },

    #[error("Unit {unit} cannot {event:?}: dependency {dependency} is {state}")]
    DependencyUnsatisfied {
        unit: String,
        event: TransitionEvent,
        dependency: String,
        state: UnitState,
    },

    #[error("Unknown unit: {unit}")]
    UnknownUnit { unit: String },
}

/// Failures reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint storage I/O failed for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint {key} not found")]
    NotFound { key: String },

    #[error("No valid checkpoint available")]
    NoneAvailable,

    #[error("Checkpoint {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Checkpoint {key} has unsupported schema version {version}")]
    UnsupportedVersion { key: String, version: u32 },

    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Checkpoint {key} references an invalid plan: {source}")]
    InvalidPlan {
        key: String,
        #[source]
        source: GraphValidationError,
    },
}

/// Errors surfaced to the caller of a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphValidationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Failed to resume run: {0}")]
    Resume(#[source] CheckpointError),

    #[error("Invalid run configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Run task terminated unexpectedly: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_dependency_lists_cycle_in_order() {
        let err = GraphValidationError::CircularDependency {
            cycle: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> c");
    }

    #[test]
    fn unknown_dependency_carries_both_ids() {
        let err = GraphValidationError::UnknownDependency {
            unit: "02".into(),
            dependency: "nonexistent".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("02"));
        assert!(msg.contains("nonexistent"));
    }

    #[test]
    fn invalid_transition_is_matchable() {
        let err = TransitionError::InvalidTransition {
            unit: "01".into(),
            from: UnitState::Completed,
            event: TransitionEvent::Dispatch,
        };
        match &err {
            TransitionError::InvalidTransition { from, event, .. } => {
                assert_eq!(*from, UnitState::Completed);
                assert_eq!(*event, TransitionEvent::Dispatch);
            }
            _ => panic!("Expected InvalidTransition"),
        }
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn engine_error_converts_from_graph_error() {
        let err: EngineError = GraphValidationError::SelfDependency { unit: "x".into() }.into();
        assert!(matches!(
            err,
            EngineError::Graph(GraphValidationError::SelfDependency { .. })
        ));
    }

    #[test]
    fn checkpoint_io_error_carries_key() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = CheckpointError::Io {
            key: "0001".into(),
            source: io,
        };
        assert!(err.to_string().contains("0001"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GraphValidationError::EmptyId { position: 0 });
        assert_std_error(&TransitionError::UnknownUnit { unit: "x".into() });
        assert_std_error(&CheckpointError::NoneAvailable);
        assert_std_error(&EngineError::Join("panic".into()));
    }
}
