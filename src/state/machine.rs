//! The execution state machine: sole owner of the per-unit lifecycle map.
//!
//! All mutation goes through [`StateMachine`], which validates each request
//! against the transition table and the dependency graph, commits it under
//! the write lock and publishes the resulting [`Event`] before releasing it.

use crate::config::SkippedDependency;
use crate::dag::{PlanGraph, UnitRef};
use crate::errors::TransitionError;
use crate::events::{Event, EventBus};
use crate::state::unit::{
    ErrorCategory, Transition, TransitionEvent, UnitError, UnitId, UnitKind, UnitRecord,
    UnitState,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-unit records in schedule order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<UnitRecord>", into = "Vec<UnitRecord>")]
pub struct ExecutionState {
    units: Vec<UnitRecord>,
    index: HashMap<UnitId, usize>,
}

impl From<Vec<UnitRecord>> for ExecutionState {
    fn from(units: Vec<UnitRecord>) -> Self {
        let index = units
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self { units, index }
    }
}

impl From<ExecutionState> for Vec<UnitRecord> {
    fn from(state: ExecutionState) -> Self {
        state.units
    }
}

impl ExecutionState {
    /// Fresh state with every unit `Pending`.
    pub fn new(graph: &PlanGraph) -> Self {
        let units = graph
            .schedule()
            .iter()
            .map(|id| {
                let (kind, phase) = match graph.locate(id) {
                    Some(UnitRef::Task { .. }) => (UnitKind::Task, graph.owning_phase(id)),
                    _ => (UnitKind::Phase, None),
                };
                UnitRecord::new(id.clone(), kind, phase)
            })
            .collect::<Vec<_>>();
        Self::from(units)
    }

    pub fn get(&self, id: &UnitId) -> Option<&UnitRecord> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    fn get_mut(&mut self, id: &UnitId) -> Option<&mut UnitRecord> {
        self.index.get(id).map(|&i| &mut self.units[i])
    }

    pub fn state_of(&self, id: &UnitId) -> Option<UnitState> {
        self.get(id).map(|r| r.state)
    }

    /// Records in schedule order.
    pub fn records(&self) -> &[UnitRecord] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Ids of units currently in `state`, in schedule order.
    pub fn in_state(&self, state: UnitState) -> Vec<UnitId> {
        self.units
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Whether every unit has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.units.iter().all(|r| r.state.is_terminal())
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for record in &self.units {
            counts.add(record.state);
        }
        counts
    }

    /// Whether this state describes exactly the units of `graph`.
    pub fn matches(&self, graph: &PlanGraph) -> bool {
        self.units.len() == graph.unit_count()
            && graph.schedule().iter().all(|id| self.index.contains_key(id))
    }

    /// Reset in-flight units to `Pending` for a resumed run. Attempt counts
    /// and errors are kept; terminal units are untouched.
    pub fn normalize_for_resume(&mut self) {
        for record in &mut self.units {
            let resumed = record.state.resumed();
            if resumed != record.state {
                record.state = resumed;
                record.started_at = None;
            }
        }
    }
}

/// Number of units per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub skipped: usize,
    pub aborted: usize,
}

impl StateCounts {
    fn add(&mut self, state: UnitState) {
        match state {
            UnitState::Pending => self.pending += 1,
            UnitState::Ready => self.ready += 1,
            UnitState::Running => self.running += 1,
            UnitState::Completed => self.completed += 1,
            UnitState::Failed => self.failed += 1,
            UnitState::Retrying => self.retrying += 1,
            UnitState::Skipped => self.skipped += 1,
            UnitState::Aborted => self.aborted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.ready
            + self.running
            + self.completed
            + self.failed
            + self.retrying
            + self.skipped
            + self.aborted
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.skipped + self.aborted
    }
}

/// What a pending unit's dependencies allow.
enum Readiness {
    Ready,
    Blocked,
    Doomed(UnitId),
}

/// Serialises all lifecycle changes for one run.
pub struct StateMachine {
    graph: Arc<PlanGraph>,
    state: RwLock<ExecutionState>,
    bus: EventBus,
    skipped_dependency: SkippedDependency,
}

impl StateMachine {
    pub fn new(graph: Arc<PlanGraph>, bus: EventBus, skipped_dependency: SkippedDependency) -> Self {
        let state = ExecutionState::new(&graph);
        Self::with_state(graph, state, bus, skipped_dependency)
    }

    /// Restore from a checkpointed state. In-flight units are reset to
    /// `Pending`; no events are emitted.
    pub fn restore(
        graph: Arc<PlanGraph>,
        mut state: ExecutionState,
        bus: EventBus,
        skipped_dependency: SkippedDependency,
    ) -> Self {
        state.normalize_for_resume();
        Self::with_state(graph, state, bus, skipped_dependency)
    }

    fn with_state(
        graph: Arc<PlanGraph>,
        state: ExecutionState,
        bus: EventBus,
        skipped_dependency: SkippedDependency,
    ) -> Self {
        Self {
            graph,
            state: RwLock::new(state),
            bus,
            skipped_dependency,
        }
    }

    pub fn graph(&self) -> &Arc<PlanGraph> {
        &self.graph
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Consistent copy of the whole state.
    pub async fn snapshot(&self) -> ExecutionState {
        self.state.read().await.clone()
    }

    pub async fn state_of(&self, id: &UnitId) -> Option<UnitState> {
        self.state.read().await.state_of(id)
    }

    pub async fn record(&self, id: &UnitId) -> Option<UnitRecord> {
        self.state.read().await.get(id).cloned()
    }

    pub async fn is_finished(&self) -> bool {
        self.state.read().await.is_finished()
    }

    /// `Ready` units in schedule order.
    pub async fn ready_units(&self) -> Vec<UnitId> {
        self.state.read().await.in_state(UnitState::Ready)
    }

    /// Apply one transition request.
    pub async fn apply(&self, id: &UnitId, transition: Transition) -> Result<Event, TransitionError> {
        let mut state = self.state.write().await;
        self.commit(&mut state, id, transition)
    }

    /// Move every `Pending` unit whose dependencies allow it to `Ready`, and
    /// skip every `Pending` unit that can no longer run.
    pub async fn promote(&self) -> Result<Vec<Event>, TransitionError> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();

        // Schedule order is topological, so a single pass settles chains.
        for id in self.graph.schedule() {
            if state.state_of(id) != Some(UnitState::Pending) {
                continue;
            }
            match self.readiness(&state, id) {
                Readiness::Ready => events.push(self.commit(&mut state, id, Transition::Unblock)?),
                Readiness::Doomed(cause) => {
                    events.push(self.commit(&mut state, id, Transition::Cascade { cause })?)
                }
                Readiness::Blocked => {}
            }
        }

        Ok(events)
    }

    /// Finish active phases whose tasks are all terminal. A phase with an
    /// aborted task fails and is aborted; otherwise it completes.
    pub async fn settle_phases(&self) -> Result<Vec<Event>, TransitionError> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();

        for p in self.graph.phase_graph().topological_order().iter().copied() {
            if self.graph.is_leaf_phase(p) {
                continue;
            }
            let phase_id = self.graph.unit_id(UnitRef::Phase(p));
            if state.state_of(&phase_id) != Some(UnitState::Running) {
                continue;
            }

            let tasks = self.graph.tasks_of(p);
            let all_terminal = tasks
                .iter()
                .all(|t| state.state_of(t).is_some_and(|s| s.is_terminal()));
            if !all_terminal {
                continue;
            }

            let aborted = tasks
                .iter()
                .find(|t| state.state_of(t) == Some(UnitState::Aborted));
            match aborted {
                Some(task) => {
                    let error = UnitError::new(
                        ErrorCategory::Permanent,
                        format!("task {task} aborted"),
                    );
                    events.push(self.commit(&mut state, &phase_id, Transition::Fail { error })?);
                    events.push(self.commit(&mut state, &phase_id, Transition::Abort)?);
                }
                None => events.push(self.commit(
                    &mut state,
                    &phase_id,
                    Transition::Succeed { artifact: None },
                )?),
            }
        }

        Ok(events)
    }

    /// Return every `Running` unit to `Pending`. Tasks are interrupted before
    /// their phase.
    pub async fn interrupt_running(&self) -> Result<Vec<Event>, TransitionError> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();

        for id in self.graph.schedule().iter().rev() {
            if state.state_of(id) == Some(UnitState::Running) {
                events.push(self.commit(&mut state, id, Transition::Interrupt)?);
            }
        }

        Ok(events)
    }

    fn dependency_satisfied(&self, state: UnitState) -> bool {
        match state {
            UnitState::Completed => true,
            UnitState::Skipped => self.skipped_dependency == SkippedDependency::Satisfied,
            _ => false,
        }
    }

    fn readiness(&self, state: &ExecutionState, id: &UnitId) -> Readiness {
        if let Some(UnitRef::Task { phase, .. }) = self.graph.locate(id) {
            let phase_id = self.graph.unit_id(UnitRef::Phase(phase));
            match state.state_of(&phase_id) {
                Some(UnitState::Running) => {}
                Some(UnitState::Skipped | UnitState::Aborted) => return Readiness::Doomed(phase_id),
                _ => return Readiness::Blocked,
            }
        }

        let mut ready = true;
        for dep in self.graph.dependencies(id) {
            match state.state_of(&dep) {
                Some(s) if self.dependency_satisfied(s) => {}
                Some(UnitState::Aborted | UnitState::Skipped) => return Readiness::Doomed(dep),
                _ => ready = false,
            }
        }

        if ready { Readiness::Ready } else { Readiness::Blocked }
    }

    /// Reject `Unblock`/`Dispatch` unless dependencies (and, for tasks, the
    /// owning phase) allow the unit to run.
    fn check_dependencies(
        &self,
        state: &ExecutionState,
        id: &UnitId,
        event: TransitionEvent,
    ) -> Result<(), TransitionError> {
        let unsatisfied = |dependency: &UnitId, dep_state: UnitState| {
            TransitionError::DependencyUnsatisfied {
                unit: id.to_string(),
                event,
                dependency: dependency.to_string(),
                state: dep_state,
            }
        };

        if let Some(phase_id) = state.get(id).and_then(|r| r.phase.clone()) {
            let phase_state = state.state_of(&phase_id).unwrap_or_default();
            if phase_state != UnitState::Running {
                return Err(unsatisfied(&phase_id, phase_state));
            }
        }

        for dep in self.graph.dependencies(id) {
            let dep_state = state.state_of(&dep).unwrap_or_default();
            if !self.dependency_satisfied(dep_state) {
                return Err(unsatisfied(&dep, dep_state));
            }
        }

        Ok(())
    }

    /// Validate, commit and publish one transition. Caller holds the write lock.
    fn commit(
        &self,
        state: &mut ExecutionState,
        id: &UnitId,
        transition: Transition,
    ) -> Result<Event, TransitionError> {
        let event = transition.event();
        let from = state
            .state_of(id)
            .ok_or_else(|| TransitionError::UnknownUnit {
                unit: id.to_string(),
            })?;
        let to = from
            .next(event)
            .ok_or_else(|| TransitionError::InvalidTransition {
                unit: id.to_string(),
                from,
                event,
            })?;

        if matches!(event, TransitionEvent::Unblock | TransitionEvent::Dispatch) {
            self.check_dependencies(state, id, event)?;
        }

        let payload = transition.payload();
        let now = Utc::now();
        let record = state
            .get_mut(id)
            .ok_or_else(|| TransitionError::UnknownUnit {
                unit: id.to_string(),
            })?;

        record.state = to;
        match transition {
            Transition::Dispatch => {
                record.attempts += 1;
                record.started_at = Some(now);
                record.finished_at = None;
            }
            Transition::Succeed { artifact } => {
                record.artifact = artifact;
                record.last_error = None;
                record.finished_at = Some(now);
            }
            Transition::Fail { error } => {
                record.last_error = Some(error);
                record.finished_at = Some(now);
            }
            Transition::Cascade { cause } => {
                record.skip_cause = Some(cause);
                record.finished_at = Some(now);
            }
            Transition::Interrupt => {
                record.started_at = None;
            }
            Transition::Skip | Transition::Abort => {
                if record.finished_at.is_none() {
                    record.finished_at = Some(now);
                }
            }
            Transition::Unblock | Transition::Retry { .. } | Transition::Requeue => {}
        }

        tracing::debug!(unit = %id, %from, %to, ?event, "Transition committed");

        let event = Event {
            unit_id: id.clone(),
            event,
            from,
            to,
            timestamp: now,
            payload,
        };
        self.bus.publish(event.clone());
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Resolver;
    use crate::plan::{PhaseSpec, Plan, TaskSpec};
    use tokio_stream::StreamExt;

    fn leaf_plan() -> Plan {
        Plan::new(vec![
            PhaseSpec::new("a", vec![]),
            PhaseSpec::new("b", vec!["a".into()]),
            PhaseSpec::new("c", vec!["b".into()]),
        ])
    }

    fn machine(plan: &Plan, policy: SkippedDependency) -> StateMachine {
        let graph = Arc::new(Resolver::resolve(plan).unwrap());
        StateMachine::new(graph, EventBus::new(64), policy)
    }

    fn id(s: &str) -> UnitId {
        UnitId::from(s)
    }

    async fn run_to_completion(sm: &StateMachine, unit: &str) {
        sm.apply(&id(unit), Transition::Dispatch).await.unwrap();
        sm.apply(&id(unit), Transition::Succeed { artifact: None })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_promote_respects_dependencies() {
        let sm = machine(&leaf_plan(), SkippedDependency::Cascade);

        let events = sm.promote().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(sm.ready_units().await, vec![id("a")]);

        run_to_completion(&sm, "a").await;
        sm.promote().await.unwrap();
        assert_eq!(sm.ready_units().await, vec![id("b")]);
    }

    #[tokio::test]
    async fn test_dispatch_with_unmet_dependency_is_rejected() {
        let sm = machine(&leaf_plan(), SkippedDependency::Cascade);
        sm.promote().await.unwrap();

        let err = sm.apply(&id("b"), Transition::Dispatch).await.unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));

        let err = sm.apply(&id("b"), Transition::Unblock).await.unwrap_err();
        match err {
            TransitionError::DependencyUnsatisfied { dependency, state, .. } => {
                assert_eq!(dependency, "a");
                assert_eq!(state, UnitState::Ready);
            }
            other => panic!("Expected DependencyUnsatisfied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state_untouched() {
        let sm = machine(&leaf_plan(), SkippedDependency::Cascade);
        sm.promote().await.unwrap();
        run_to_completion(&sm, "a").await;

        let err = sm.apply(&id("a"), Transition::Dispatch).await.unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidTransition {
                from: UnitState::Completed,
                ..
            }
        ));
        assert_eq!(sm.record(&id("a")).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_abort_cascades_to_dependents() {
        let sm = machine(&leaf_plan(), SkippedDependency::Cascade);
        sm.promote().await.unwrap();
        sm.apply(&id("a"), Transition::Dispatch).await.unwrap();
        sm.apply(
            &id("a"),
            Transition::Fail {
                error: UnitError::permanent("boom"),
            },
        )
        .await
        .unwrap();
        sm.apply(&id("a"), Transition::Abort).await.unwrap();

        sm.promote().await.unwrap();
        let b = sm.record(&id("b")).await.unwrap();
        let c = sm.record(&id("c")).await.unwrap();
        assert_eq!(b.state, UnitState::Skipped);
        assert_eq!(b.skip_cause, Some(id("a")));
        assert_eq!(c.state, UnitState::Skipped);
        assert_eq!(c.skip_cause, Some(id("b")));
        assert!(sm.is_finished().await);
    }

    #[tokio::test]
    async fn test_skipped_dependency_satisfied_policy() {
        let sm = machine(&leaf_plan(), SkippedDependency::Satisfied);
        sm.promote().await.unwrap();
        sm.apply(&id("a"), Transition::Dispatch).await.unwrap();
        sm.apply(
            &id("a"),
            Transition::Fail {
                error: UnitError::transient("flaky"),
            },
        )
        .await
        .unwrap();
        sm.apply(&id("a"), Transition::Skip).await.unwrap();

        sm.promote().await.unwrap();
        assert_eq!(sm.state_of(&id("b")).await, Some(UnitState::Ready));
    }

    #[tokio::test]
    async fn test_tasks_wait_for_phase_activation() {
        let plan = Plan::new(vec![PhaseSpec::new("01", vec![]).with_tasks(vec![
            TaskSpec::new("1", vec![]),
            TaskSpec::new("2", vec!["1".into()]),
        ])]);
        let sm = machine(&plan, SkippedDependency::Cascade);

        sm.promote().await.unwrap();
        assert_eq!(sm.ready_units().await, vec![id("01")]);

        sm.apply(&id("01"), Transition::Dispatch).await.unwrap();
        sm.promote().await.unwrap();
        assert_eq!(sm.ready_units().await, vec![id("01.1")]);

        run_to_completion(&sm, "01.1").await;
        assert!(sm.settle_phases().await.unwrap().is_empty());

        sm.promote().await.unwrap();
        run_to_completion(&sm, "01.2").await;
        let events = sm.settle_phases().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(sm.state_of(&id("01")).await, Some(UnitState::Completed));
    }

    #[tokio::test]
    async fn test_aborted_task_aborts_phase() {
        let plan = Plan::new(vec![
            PhaseSpec::new("01", vec![]).with_tasks(vec![TaskSpec::new("1", vec![])]),
            PhaseSpec::new("02", vec!["01".into()]).with_tasks(vec![TaskSpec::new("1", vec![])]),
        ]);
        let sm = machine(&plan, SkippedDependency::Cascade);
        sm.promote().await.unwrap();
        sm.apply(&id("01"), Transition::Dispatch).await.unwrap();
        sm.promote().await.unwrap();
        sm.apply(&id("01.1"), Transition::Dispatch).await.unwrap();
        sm.apply(
            &id("01.1"),
            Transition::Fail {
                error: UnitError::permanent("nope"),
            },
        )
        .await
        .unwrap();
        sm.apply(&id("01.1"), Transition::Abort).await.unwrap();

        sm.settle_phases().await.unwrap();
        assert_eq!(sm.state_of(&id("01")).await, Some(UnitState::Aborted));

        sm.promote().await.unwrap();
        assert_eq!(sm.state_of(&id("02")).await, Some(UnitState::Skipped));
        assert_eq!(sm.state_of(&id("02.1")).await, Some(UnitState::Skipped));
    }

    #[tokio::test]
    async fn test_events_published_in_commit_order() {
        let sm = machine(&leaf_plan(), SkippedDependency::Cascade);
        let mut stream = sm.bus().subscribe();

        sm.promote().await.unwrap();
        run_to_completion(&sm, "a").await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = stream.next().await.unwrap();
            seen.push((event.from, event.to));
        }
        assert_eq!(
            seen,
            vec![
                (UnitState::Pending, UnitState::Ready),
                (UnitState::Ready, UnitState::Running),
                (UnitState::Running, UnitState::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_interrupt_returns_running_units_to_pending() {
        let plan = Plan::new(vec![
            PhaseSpec::new("01", vec![]).with_tasks(vec![TaskSpec::new("1", vec![])]),
        ]);
        let sm = machine(&plan, SkippedDependency::Cascade);
        sm.promote().await.unwrap();
        sm.apply(&id("01"), Transition::Dispatch).await.unwrap();
        sm.promote().await.unwrap();
        sm.apply(&id("01.1"), Transition::Dispatch).await.unwrap();

        let events = sm.interrupt_running().await.unwrap();
        let order: Vec<&str> = events.iter().map(|e| e.unit_id.as_str()).collect();
        assert_eq!(order, vec!["01.1", "01"]);

        let task = sm.record(&id("01.1")).await.unwrap();
        assert_eq!(task.state, UnitState::Pending);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_restore_normalizes_without_events() {
        let sm = machine(&leaf_plan(), SkippedDependency::Cascade);
        sm.promote().await.unwrap();
        sm.apply(&id("a"), Transition::Dispatch).await.unwrap();
        let snapshot = sm.snapshot().await;

        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();
        let restored = StateMachine::restore(
            sm.graph().clone(),
            snapshot,
            bus.clone(),
            SkippedDependency::Cascade,
        );
        bus.close();

        let a = restored.record(&id("a")).await.unwrap();
        assert_eq!(a.state, UnitState::Pending);
        assert_eq!(a.attempts, 1);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_execution_state_serde_keeps_index() {
        let graph = Resolver::resolve(&leaf_plan()).unwrap();
        let state = ExecutionState::new(&graph);

        let json = serde_json::to_string(&state).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.state_of(&id("c")), Some(UnitState::Pending));
        assert!(back.matches(&graph));
        assert_eq!(back.counts().pending, 3);
    }
}
