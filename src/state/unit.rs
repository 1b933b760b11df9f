//! Unit identity, lifecycle states and the transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable identifier of a phase or task. Tasks use `"<phase>.<task>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn phase(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn task(phase: &str, task: &str) -> Self {
        Self(format!("{phase}.{task}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Phase portion of the id (the whole id for phases).
    pub fn phase_part(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(p, _)| p)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Granularity of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Phase,
    Task,
}

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a concurrency permit
    Ready,
    /// Dispatched (tasks, leaf phases) or active (phases with tasks)
    Running,
    /// Finished successfully
    Completed,
    /// Last attempt failed; awaiting a recovery decision
    Failed,
    /// Waiting out a backoff delay before becoming ready again
    Retrying,
    /// Will not run; dependents may or may not proceed depending on policy
    Skipped,
    /// Failed permanently
    Aborted,
}

impl UnitState {
    /// Check if the unit can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Aborted)
    }

    /// Check if the unit finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The edge taken by `event` from this state, if one exists.
    pub fn next(self, event: TransitionEvent) -> Option<UnitState> {
        use TransitionEvent as E;
        use UnitState as S;

        match (self, event) {
            (S::Pending, E::Unblock) => Some(S::Ready),
            (S::Ready, E::Dispatch) => Some(S::Running),
            (S::Running, E::Succeed) => Some(S::Completed),
            (S::Running, E::Fail) => Some(S::Failed),
            (S::Running, E::Interrupt) => Some(S::Pending),
            (S::Failed, E::Retry) => Some(S::Retrying),
            (S::Failed, E::Skip) => Some(S::Skipped),
            (S::Failed, E::Abort) => Some(S::Aborted),
            (S::Retrying, E::Requeue) => Some(S::Ready),
            (S::Pending | S::Ready | S::Retrying, E::Cascade) => Some(S::Skipped),
            _ => None,
        }
    }

    /// State a unit is restored to when a run resumes from a checkpoint.
    /// Terminal states are kept; anything in flight starts over.
    pub fn resumed(self) -> UnitState {
        if self.is_terminal() {
            self
        } else {
            UnitState::Pending
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Pending => "pending",
            UnitState::Ready => "ready",
            UnitState::Running => "running",
            UnitState::Completed => "completed",
            UnitState::Failed => "failed",
            UnitState::Retrying => "retrying",
            UnitState::Skipped => "skipped",
            UnitState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// The kinds of lifecycle events. Data-free so it can appear in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    Unblock,
    Dispatch,
    Succeed,
    Fail,
    Retry,
    Requeue,
    Skip,
    Abort,
    Cascade,
    Interrupt,
}

/// Category of a unit failure, used by the recovery classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Likely to succeed if tried again
    Transient,
    /// Will fail again no matter how often it is retried
    Permanent,
    /// Exceeded the per-unit timeout
    Timeout,
    /// The delegate could not say
    Unknown,
    /// Interrupted by cancellation; never classified
    Cancelled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error reported for a failed unit execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub category: ErrorCategory,
    pub message: String,
}

impl UnitError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permanent, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// A transition request together with the data it commits.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unblock,
    Dispatch,
    Succeed { artifact: Option<serde_json::Value> },
    Fail { error: UnitError },
    Retry { delay: Duration },
    Requeue,
    Skip,
    Abort,
    Cascade { cause: UnitId },
    Interrupt,
}

impl Transition {
    pub fn event(&self) -> TransitionEvent {
        match self {
            Transition::Unblock => TransitionEvent::Unblock,
            Transition::Dispatch => TransitionEvent::Dispatch,
            Transition::Succeed { .. } => TransitionEvent::Succeed,
            Transition::Fail { .. } => TransitionEvent::Fail,
            Transition::Retry { .. } => TransitionEvent::Retry,
            Transition::Requeue => TransitionEvent::Requeue,
            Transition::Skip => TransitionEvent::Skip,
            Transition::Abort => TransitionEvent::Abort,
            Transition::Cascade { .. } => TransitionEvent::Cascade,
            Transition::Interrupt => TransitionEvent::Interrupt,
        }
    }

    /// Payload attached to the emitted event.
    pub fn payload(&self) -> Option<serde_json::Value> {
        match self {
            Transition::Succeed { artifact } => artifact.clone(),
            Transition::Fail { error } => serde_json::to_value(error).ok(),
            Transition::Retry { delay } => {
                Some(serde_json::json!({ "delay_ms": delay.as_millis() as u64 }))
            }
            Transition::Cascade { cause } => Some(serde_json::json!({ "cause": cause })),
            _ => None,
        }
    }
}

/// Everything the engine knows about one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: UnitId,
    pub kind: UnitKind,
    /// Owning phase (tasks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<UnitId>,
    pub state: UnitState,
    /// Number of times the unit was dispatched
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<UnitError>,
    /// Why the unit was skipped by cascade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<UnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitRecord {
    pub fn new(id: UnitId, kind: UnitKind, phase: Option<UnitId>) -> Self {
        Self {
            id,
            kind,
            phase,
            state: UnitState::Pending,
            attempts: 0,
            last_error: None,
            skip_cause: None,
            artifact: None,
            started_at: None,
            finished_at: None,
        }
    }
}
