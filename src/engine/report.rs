//! Final result of a run.

use crate::recovery::RecoveryCounters;
use crate::state::{StateCounts, UnitRecord, UnitState};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every unit completed
    Completed,
    /// Every unit is terminal and some were skipped, none aborted
    CompletedWithSkips,
    /// A unit was aborted, or fail-fast halted the run
    Failed,
    /// Halted by an external cancellation
    Cancelled,
}

impl RunStatus {
    /// Whether the run counts as successful for exit codes.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithSkips)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::CompletedWithSkips => write!(f, "completed with skips"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-unit outcome plus run totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Records in schedule order, as left when the run returned
    pub units: Vec<UnitRecord>,
    pub counts: StateCounts,
    pub recovery: RecoveryCounters,
    /// Id of the final checkpoint, if it could be written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Events dropped by slow subscribers
    pub events_dropped: u64,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunReport {
    pub fn unit(&self, id: &str) -> Option<&UnitRecord> {
        self.units.iter().find(|r| r.id.as_str() == id)
    }

    pub fn state_of(&self, id: &str) -> Option<UnitState> {
        self.unit(id).map(|r| r.state)
    }

    /// Units that ended `Aborted`, with their errors.
    pub fn aborted(&self) -> Vec<&UnitRecord> {
        self.units
            .iter()
            .filter(|r| r.state == UnitState::Aborted)
            .collect()
    }
}

/// Tracks execution timing.
pub(crate) struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Durations as whole milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
