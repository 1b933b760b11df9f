//! Two-level resolution of a plan: one graph over phases and one graph over
//! the tasks of each phase.

use crate::dag::builder::{DagBuilder, UnitGraph, UnitIndex, UnitNode};
use crate::errors::GraphValidationError;
use crate::plan::{PhaseSpec, Plan, TaskSpec};
use crate::state::{UnitId, UnitKind};
use std::collections::HashMap;

/// Where a unit lives in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitRef {
    Phase(UnitIndex),
    Task { phase: UnitIndex, task: UnitIndex },
}

impl UnitRef {
    pub fn kind(&self) -> UnitKind {
        match self {
            UnitRef::Phase(_) => UnitKind::Phase,
            UnitRef::Task { .. } => UnitKind::Task,
        }
    }

    pub fn phase_index(&self) -> UnitIndex {
        match *self {
            UnitRef::Phase(p) | UnitRef::Task { phase: p, .. } => p,
        }
    }
}

/// A resolved plan: validated graphs plus a global schedule order.
#[derive(Debug, Clone)]
pub struct PlanGraph {
    plan: Plan,
    phases: UnitGraph,
    /// Task graph per phase, indexed like `plan.phases`
    tasks: Vec<UnitGraph>,
    /// Every unit in schedule order: each phase in topological order,
    /// followed by its tasks in topological order
    schedule: Vec<UnitId>,
    lookup: HashMap<UnitId, UnitRef>,
}

impl PlanGraph {
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn phase_graph(&self) -> &UnitGraph {
        &self.phases
    }

    pub fn task_graph(&self, phase: UnitIndex) -> Option<&UnitGraph> {
        self.tasks.get(phase)
    }

    pub fn phase_spec(&self, phase: UnitIndex) -> Option<&PhaseSpec> {
        self.plan.phases.get(phase)
    }

    pub fn task_spec(&self, phase: UnitIndex, task: UnitIndex) -> Option<&TaskSpec> {
        self.plan.phases.get(phase).and_then(|p| p.tasks.get(task))
    }

    /// All unit ids in schedule order. Earlier means higher priority when
    /// more units are ready than budgets allow.
    pub fn schedule(&self) -> &[UnitId] {
        &self.schedule
    }

    pub fn unit_count(&self) -> usize {
        self.schedule.len()
    }

    pub fn locate(&self, id: &UnitId) -> Option<UnitRef> {
        self.lookup.get(id).copied()
    }

    pub fn unit_id(&self, unit: UnitRef) -> UnitId {
        match unit {
            UnitRef::Phase(p) => UnitId::phase(&self.plan.phases[p].id),
            UnitRef::Task { phase, task } => {
                let phase = &self.plan.phases[phase];
                UnitId::task(&phase.id, &phase.tasks[task].id)
            }
        }
    }

    /// Declared dependencies of a unit, at the unit's own granularity.
    pub fn dependencies(&self, id: &UnitId) -> Vec<UnitId> {
        match self.locate(id) {
            Some(UnitRef::Phase(p)) => self
                .phases
                .dependencies(p)
                .iter()
                .map(|&d| self.unit_id(UnitRef::Phase(d)))
                .collect(),
            Some(UnitRef::Task { phase, task }) => self.tasks[phase]
                .dependencies(task)
                .iter()
                .map(|&d| self.unit_id(UnitRef::Task { phase, task: d }))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Units that transitively depend on the given unit, at the same granularity.
    pub fn transitive_dependents(&self, id: &UnitId) -> Vec<UnitId> {
        match self.locate(id) {
            Some(UnitRef::Phase(p)) => self
                .phases
                .transitive_dependents(p)
                .into_iter()
                .map(|d| self.unit_id(UnitRef::Phase(d)))
                .collect(),
            Some(UnitRef::Task { phase, task }) => self.tasks[phase]
                .transitive_dependents(task)
                .into_iter()
                .map(|d| self.unit_id(UnitRef::Task { phase, task: d }))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Unit ids of a phase's tasks in topological order.
    pub fn tasks_of(&self, phase: UnitIndex) -> Vec<UnitId> {
        self.tasks
            .get(phase)
            .map(|graph| {
                graph
                    .topological_order()
                    .iter()
                    .map(|&t| self.unit_id(UnitRef::Task { phase, task: t }))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Owning phase of a task, or the phase itself.
    pub fn owning_phase(&self, id: &UnitId) -> Option<UnitId> {
        self.locate(id)
            .map(|unit| self.unit_id(UnitRef::Phase(unit.phase_index())))
    }

    pub fn is_leaf_phase(&self, phase: UnitIndex) -> bool {
        self.plan
            .phases
            .get(phase)
            .is_some_and(PhaseSpec::is_leaf)
    }
}

/// Builds `PlanGraph`s. The same entry point is used for fresh runs and for
/// plans recovered from checkpoints.
pub struct Resolver;

impl Resolver {
    pub fn resolve(plan: &Plan) -> Result<PlanGraph, GraphValidationError> {
        for phase in &plan.phases {
            if phase.id.contains('.') {
                return Err(GraphValidationError::InvalidPhaseId {
                    phase: phase.id.clone(),
                });
            }
        }

        let phases = DagBuilder::new(
            plan.phases
                .iter()
                .map(|p| UnitNode::new(&p.id, p.depends_on.clone()))
                .collect(),
        )
        .build()?;

        let mut tasks = Vec::with_capacity(plan.phases.len());
        for phase in &plan.phases {
            let graph = DagBuilder::new(
                phase
                    .tasks
                    .iter()
                    .map(|t| UnitNode::new(&t.id, t.depends_on.clone()))
                    .collect(),
            )
            .build()
            .map_err(|e| qualify(&phase.id, e))?;
            tasks.push(graph);
        }

        let mut graph = PlanGraph {
            plan: plan.clone(),
            phases,
            tasks,
            schedule: Vec::with_capacity(plan.unit_count()),
            lookup: HashMap::with_capacity(plan.unit_count()),
        };

        let phase_order = graph.phases.topological_order().to_vec();
        for p in phase_order {
            let phase_ref = UnitRef::Phase(p);
            let id = graph.unit_id(phase_ref);
            graph.lookup.insert(id.clone(), phase_ref);
            graph.schedule.push(id);

            let task_order = graph.tasks[p].topological_order().to_vec();
            for t in task_order {
                let task_ref = UnitRef::Task { phase: p, task: t };
                let id = graph.unit_id(task_ref);
                graph.lookup.insert(id.clone(), task_ref);
                graph.schedule.push(id);
            }
        }

        Ok(graph)
    }
}

/// Task graph errors name tasks by their full unit id.
fn qualify(phase: &str, err: GraphValidationError) -> GraphValidationError {
    let full = |task: String| UnitId::task(phase, &task).to_string();
    match err {
        GraphValidationError::CircularDependency { cycle } => {
            GraphValidationError::CircularDependency {
                cycle: cycle.into_iter().map(full).collect(),
            }
        }
        GraphValidationError::UnknownDependency { unit, dependency } => {
            GraphValidationError::UnknownDependency {
                unit: full(unit),
                dependency: full(dependency),
            }
        }
        GraphValidationError::SelfDependency { unit } => {
            GraphValidationError::SelfDependency { unit: full(unit) }
        }
        GraphValidationError::DuplicateUnit { unit } => {
            GraphValidationError::DuplicateUnit { unit: full(unit) }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PhaseSpec, TaskSpec};

    fn task(id: &str, deps: Vec<&str>) -> TaskSpec {
        TaskSpec::new(id, deps.into_iter().map(String::from).collect())
    }

    fn phase(id: &str, deps: Vec<&str>, tasks: Vec<TaskSpec>) -> PhaseSpec {
        PhaseSpec::new(id, deps.into_iter().map(String::from).collect()).with_tasks(tasks)
    }

    #[test]
    fn test_schedule_interleaves_phases_and_tasks() {
        let plan = Plan::new(vec![
            phase("build", vec!["setup"], vec![task("link", vec!["compile"]), task("compile", vec![])]),
            phase("setup", vec![], vec![]),
        ]);

        let graph = Resolver::resolve(&plan).unwrap();
        let schedule: Vec<&str> = graph.schedule().iter().map(UnitId::as_str).collect();
        assert_eq!(schedule, vec!["setup", "build", "build.compile", "build.link"]);
    }

    #[test]
    fn test_locate_and_dependencies() {
        let plan = Plan::new(vec![phase(
            "01",
            vec![],
            vec![task("a", vec![]), task("b", vec!["a"])],
        )]);
        let graph = Resolver::resolve(&plan).unwrap();

        let b = UnitId::task("01", "b");
        assert_eq!(graph.locate(&b), Some(UnitRef::Task { phase: 0, task: 1 }));
        assert_eq!(graph.dependencies(&b), vec![UnitId::task("01", "a")]);
        assert_eq!(graph.owning_phase(&b), Some(UnitId::phase("01")));
        assert!(!graph.is_leaf_phase(0));
    }

    #[test]
    fn test_task_cycle_is_reported_with_full_ids() {
        let plan = Plan::new(vec![phase(
            "01",
            vec![],
            vec![task("a", vec!["b"]), task("b", vec!["a"])],
        )]);

        let err = Resolver::resolve(&plan).unwrap_err();
        assert_eq!(
            err,
            GraphValidationError::CircularDependency {
                cycle: vec!["01.a".into(), "01.b".into()]
            }
        );
    }

    #[test]
    fn test_task_cannot_depend_on_other_phase_task() {
        let plan = Plan::new(vec![
            phase("01", vec![], vec![task("a", vec![])]),
            phase("02", vec!["01"], vec![task("b", vec!["a"])]),
        ]);

        let err = Resolver::resolve(&plan).unwrap_err();
        assert!(matches!(err, GraphValidationError::UnknownDependency { .. }));
    }

    #[test]
    fn test_phase_id_with_dot_rejected() {
        let plan = Plan::new(vec![phase("1.0", vec![], vec![])]);
        let err = Resolver::resolve(&plan).unwrap_err();
        assert!(matches!(err, GraphValidationError::InvalidPhaseId { .. }));
    }

    #[test]
    fn test_self_dependent_phase_fails() {
        let plan = Plan::new(vec![phase("x", vec!["x"], vec![])]);
        let err = Resolver::resolve(&plan).unwrap_err();
        assert_eq!(err, GraphValidationError::SelfDependency { unit: "x".into() });
    }

    #[test]
    fn test_transitive_dependents_stay_at_granularity() {
        let plan = Plan::new(vec![
            phase("01", vec![], vec![task("a", vec![]), task("b", vec!["a"])]),
            phase("02", vec!["01"], vec![]),
        ]);
        let graph = Resolver::resolve(&plan).unwrap();

        assert_eq!(
            graph.transitive_dependents(&UnitId::phase("01")),
            vec![UnitId::phase("02")]
        );
        assert_eq!(
            graph.transitive_dependents(&UnitId::task("01", "a")),
            vec![UnitId::task("01", "b")]
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let plan = Plan::new(vec![
            phase("c", vec![], vec![]),
            phase("a", vec![], vec![]),
            phase("b", vec!["a", "c"], vec![]),
        ]);
        let first = Resolver::resolve(&plan).unwrap();
        let second = Resolver::resolve(&plan).unwrap();
        assert_eq!(first.schedule(), second.schedule());
    }
}
