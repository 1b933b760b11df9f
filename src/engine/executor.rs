//! The delegate that performs the actual work of a unit.

use crate::dag::{PlanGraph, UnitRef};
use crate::state::{ErrorCategory, UnitError, UnitId, UnitKind};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the executor is asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDescriptor {
    pub id: UnitId,
    pub kind: UnitKind,
    /// Id of the phase the unit belongs to (the unit itself for phases)
    pub phase: String,
    pub name: Option<String>,
    /// Opaque payload from the plan
    pub payload: serde_json::Value,
}

impl UnitDescriptor {
    pub(crate) fn from_graph(graph: &PlanGraph, id: &UnitId) -> Option<Self> {
        match graph.locate(id)? {
            UnitRef::Phase(p) => {
                let spec = graph.phase_spec(p)?;
                Some(Self {
                    id: id.clone(),
                    kind: UnitKind::Phase,
                    phase: spec.id.clone(),
                    name: spec.name.clone(),
                    payload: spec.payload.clone(),
                })
            }
            UnitRef::Task { phase, task } => {
                let phase_spec = graph.phase_spec(phase)?;
                let spec = graph.task_spec(phase, task)?;
                Some(Self {
                    id: id.clone(),
                    kind: UnitKind::Task,
                    phase: phase_spec.id.clone(),
                    name: spec.name.clone(),
                    payload: spec.payload.clone(),
                })
            }
        }
    }
}

/// Everything handed to one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub unit: UnitDescriptor,
    /// 1-based attempt number
    pub attempt: u32,
    /// Triggered when the run halts; the attempt's future is dropped as well
    pub cancel: CancellationToken,
}

/// Result reported by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub artifact: Option<serde_json::Value>,
    pub error: Option<UnitError>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            artifact: None,
            error: None,
        }
    }

    pub fn with_artifact(artifact: serde_json::Value) -> Self {
        Self {
            artifact: Some(artifact),
            ..Self::success()
        }
    }

    pub fn failure(error: UnitError) -> Self {
        Self {
            success: false,
            artifact: None,
            error: Some(error),
        }
    }

    /// The error to hand to recovery for a failed outcome.
    pub(crate) fn into_error(self) -> UnitError {
        self.error.unwrap_or_else(|| {
            UnitError::new(
                ErrorCategory::Unknown,
                "executor reported failure without an error",
            )
        })
    }
}

/// Performs unit work. Implementations must not retry internally; the
/// engine decides about retries.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Resolver;
    use crate::plan::{PhaseSpec, Plan, TaskSpec};

    #[test]
    fn test_descriptor_for_task_carries_payload() {
        let plan = Plan::new(vec![
            PhaseSpec::new("build", vec![]).with_tasks(vec![
                TaskSpec::new("compile", vec![]).with_payload(serde_json::json!({"command": "make"})),
            ]),
        ]);
        let graph = Resolver::resolve(&plan).unwrap();

        let unit = UnitDescriptor::from_graph(&graph, &UnitId::task("build", "compile")).unwrap();
        assert_eq!(unit.kind, UnitKind::Task);
        assert_eq!(unit.phase, "build");
        assert_eq!(unit.payload["command"], "make");

        assert!(UnitDescriptor::from_graph(&graph, &UnitId::from("missing")).is_none());
    }

    #[test]
    fn test_failure_without_error_is_unknown() {
        let outcome = ExecutionOutcome {
            success: false,
            artifact: None,
            error: None,
        };
        assert_eq!(outcome.into_error().category, ErrorCategory::Unknown);
    }
}
