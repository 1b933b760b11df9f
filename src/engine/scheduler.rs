//! The run loop.
//!
//! One loop per run owns admission: it promotes units, hands `Ready` units to
//! the executor within the phase and task budgets, and routes results back
//! through the state machine and the recovery controller. Executions run as
//! spawned tasks and report over an mpsc channel; retry delays are timers
//! that report over the same channel.

use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointWriter};
use crate::config::RunConfig;
use crate::dag::{PlanGraph, UnitIndex, UnitRef};
use crate::engine::executor::{ExecutionContext, ExecutionOutcome, TaskExecutor, UnitDescriptor};
use crate::engine::report::{ExecutionTimer, RunReport, RunStatus};
use crate::errors::{EngineError, TransitionError};
use crate::events::Event;
use crate::recovery::{Decision, RecoveryController};
use crate::state::{ErrorCategory, StateMachine, Transition, UnitError, UnitId};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Messages from executions and retry timers back to the loop.
#[derive(Debug)]
enum Message {
    Finished {
        unit: UnitId,
        attempt: u32,
        outcome: ExecutionOutcome,
    },
    RetryDue {
        unit: UnitId,
    },
}

/// Why the loop stopped admitting work before every unit was terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    FailFast,
    Stalled,
}

/// A dispatched execution. Dropping it releases its permits.
struct InFlight {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    /// Held by leaf phases only
    phase_permit: Option<OwnedSemaphorePermit>,
    task_permit: OwnedSemaphorePermit,
}

/// Everything needed to start a run loop.
pub(crate) struct RunSetup {
    pub run_id: Uuid,
    pub graph: Arc<PlanGraph>,
    pub machine: Arc<StateMachine>,
    pub config: RunConfig,
    pub executor: Arc<dyn TaskExecutor>,
    pub recovery: RecoveryController,
    pub checkpoints: CheckpointManager,
    /// Sequence number of the first checkpoint this run writes
    pub next_sequence: u64,
    pub cancel: CancellationToken,
}

pub(crate) struct Scheduler {
    run_id: Uuid,
    graph: Arc<PlanGraph>,
    machine: Arc<StateMachine>,
    config: RunConfig,
    executor: Arc<dyn TaskExecutor>,
    recovery: RecoveryController,
    checkpoints: CheckpointManager,
    next_sequence: u64,
    cancel: CancellationToken,

    phase_permits: Arc<Semaphore>,
    task_permits: HashMap<UnitIndex, Arc<Semaphore>>,
    /// Phase permits held by active (non-leaf) phases
    active_phases: HashMap<UnitId, OwnedSemaphorePermit>,
    /// Phase permits held by leaf phases waiting out a retry delay
    backoff_permits: HashMap<UnitId, OwnedSemaphorePermit>,
    in_flight: HashMap<UnitId, InFlight>,
    retry_timers: HashMap<UnitId, JoinHandle<()>>,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    /// A unit became terminal since the last checkpoint submission
    dirty: bool,
}

impl Scheduler {
    pub(crate) fn new(setup: RunSetup) -> Self {
        let (tx, rx) = mpsc::channel(100);
        let phase_permits = Arc::new(Semaphore::new(setup.config.scheduler.max_concurrent_phases));

        Self {
            run_id: setup.run_id,
            graph: setup.graph,
            machine: setup.machine,
            config: setup.config,
            executor: setup.executor,
            recovery: setup.recovery,
            checkpoints: setup.checkpoints,
            next_sequence: setup.next_sequence,
            cancel: setup.cancel,
            phase_permits,
            task_permits: HashMap::new(),
            active_phases: HashMap::new(),
            backoff_permits: HashMap::new(),
            in_flight: HashMap::new(),
            retry_timers: HashMap::new(),
            tx,
            rx,
            dirty: false,
        }
    }

    /// Drive the run until every unit is terminal or the run halts, then
    /// write the final checkpoint.
    pub(crate) async fn run(mut self) -> Result<RunReport, EngineError> {
        let timer = ExecutionTimer::start();
        let writer = self.checkpoints.spawn_writer();

        tracing::info!(
            run_id = %self.run_id,
            units = self.graph.unit_count(),
            waves = self.graph.phase_graph().waves().len(),
            "Run started"
        );

        let initial = self.checkpoint().await;
        writer.submit(initial);

        let outcome = self.run_loop(&writer).await;

        // Anything still in flight is stopped on every exit path
        let interrupted = self.stop_in_flight().await;

        let final_checkpoint = self.checkpoint().await;
        let checkpoint = match writer.finish(final_checkpoint).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(error = %e, "Final checkpoint could not be written");
                None
            }
        };
        self.machine.bus().close();

        let halt = outcome?;
        interrupted?;

        let snapshot = self.machine.snapshot().await;
        let counts = snapshot.counts();
        let status = match halt {
            Some(Halt::Cancelled) => RunStatus::Cancelled,
            Some(Halt::FailFast | Halt::Stalled) => RunStatus::Failed,
            None if counts.aborted > 0 => RunStatus::Failed,
            None if counts.skipped > 0 => RunStatus::CompletedWithSkips,
            None => RunStatus::Completed,
        };

        tracing::info!(
            run_id = %self.run_id,
            %status,
            completed = counts.completed,
            skipped = counts.skipped,
            aborted = counts.aborted,
            "Run finished"
        );

        Ok(RunReport {
            run_id: self.run_id,
            status,
            units: snapshot.records().to_vec(),
            counts,
            recovery: self.recovery.counters().clone(),
            checkpoint,
            events_dropped: self.machine.bus().dropped(),
            duration: timer.elapsed(),
        })
    }

    async fn run_loop(&mut self, writer: &CheckpointWriter) -> Result<Option<Halt>, TransitionError> {
        let period = self
            .config
            .checkpoint_interval()
            .max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Some(Halt::Cancelled));
            }

            self.settle().await?;
            if self.admit().await? {
                // Newly active phases have tasks to promote
                continue;
            }

            if self.dirty {
                writer.submit(self.checkpoint().await);
                self.dirty = false;
            }

            if self.in_flight.is_empty() && self.retry_timers.is_empty() {
                if self.machine.is_finished().await {
                    return Ok(None);
                }
                let snapshot = self.machine.snapshot().await;
                tracing::error!(
                    counts = ?snapshot.counts(),
                    "No unit can make progress"
                );
                return Ok(Some(Halt::Stalled));
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(run_id = %self.run_id, "Run cancelled");
                    return Ok(Some(Halt::Cancelled));
                }
                Some(message) = self.rx.recv() => {
                    if let Some(halt) = self.handle(message).await? {
                        return Ok(Some(halt));
                    }
                }
                _ = ticker.tick() => {
                    tracing::debug!("Periodic checkpoint");
                    writer.submit(self.checkpoint().await);
                }
            }
        }
    }

    /// Promote pending units and finish phases until nothing changes.
    async fn settle(&mut self) -> Result<(), TransitionError> {
        loop {
            let promoted = self.machine.promote().await?;
            let settled = self.machine.settle_phases().await?;
            self.observe(&promoted);
            self.observe(&settled);

            for event in &settled {
                if event.to.is_terminal() && self.active_phases.remove(&event.unit_id).is_some() {
                    tracing::info!(phase = %event.unit_id, state = %event.to, "Phase finished");
                }
            }

            if promoted.is_empty() && settled.is_empty() {
                return Ok(());
            }
        }
    }

    /// Dispatch ready units within the budgets. Returns true if a phase with
    /// tasks was activated.
    async fn admit(&mut self) -> Result<bool, TransitionError> {
        let mut activated = false;

        for id in self.machine.ready_units().await {
            let Some(unit) = self.graph.locate(&id) else {
                continue;
            };

            match unit {
                UnitRef::Phase(p) if self.graph.is_leaf_phase(p) => {
                    let Ok(task_permit) = self.task_semaphore(p).try_acquire_owned() else {
                        continue;
                    };
                    let Some(phase_permit) = self.take_phase_permit(&id) else {
                        continue;
                    };
                    self.dispatch(&id, Some(phase_permit), task_permit).await?;
                }
                UnitRef::Phase(_) => {
                    let Some(phase_permit) = self.take_phase_permit(&id) else {
                        continue;
                    };
                    self.machine.apply(&id, Transition::Dispatch).await?;
                    self.active_phases.insert(id.clone(), phase_permit);
                    tracing::info!(phase = %id, "Phase active");
                    activated = true;
                }
                UnitRef::Task { phase, .. } => {
                    let Ok(task_permit) = self.task_semaphore(phase).try_acquire_owned() else {
                        continue;
                    };
                    self.dispatch(&id, None, task_permit).await?;
                }
            }
        }

        Ok(activated)
    }

    /// A phase permit kept from an earlier attempt, or a fresh one if the
    /// phase budget allows.
    fn take_phase_permit(&mut self, id: &UnitId) -> Option<OwnedSemaphorePermit> {
        self.backoff_permits
            .remove(id)
            .or_else(|| self.phase_permits.clone().try_acquire_owned().ok())
    }

    fn task_semaphore(&mut self, phase: UnitIndex) -> Arc<Semaphore> {
        let limit = self.config.scheduler.max_concurrent_tasks;
        self.task_permits
            .entry(phase)
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    async fn dispatch(
        &mut self,
        id: &UnitId,
        phase_permit: Option<OwnedSemaphorePermit>,
        task_permit: OwnedSemaphorePermit,
    ) -> Result<(), TransitionError> {
        let Some(unit) = UnitDescriptor::from_graph(&self.graph, id) else {
            return Err(TransitionError::UnknownUnit {
                unit: id.to_string(),
            });
        };

        self.machine.apply(id, Transition::Dispatch).await?;
        let attempt = self
            .machine
            .record(id)
            .await
            .map(|r| r.attempts)
            .unwrap_or(1);

        tracing::info!(unit = %id, attempt, "Unit dispatched");

        let cancel = self.cancel.child_token();
        let ctx = ExecutionContext {
            run_id: self.run_id,
            unit,
            attempt,
            cancel: cancel.clone(),
        };
        let executor = self.executor.clone();
        let tx = self.tx.clone();
        let timeout = self.config.per_unit_timeout();
        let unit_id = id.clone();

        let handle = tokio::spawn(async move {
            let work = AssertUnwindSafe(executor.execute(ctx)).catch_unwind();
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or_else(|_| Ok(ExecutionOutcome::failure(UnitError::timeout(limit)))),
                None => work.await,
            };
            let outcome = result.unwrap_or_else(|_| {
                ExecutionOutcome::failure(UnitError::new(
                    ErrorCategory::Unknown,
                    "executor panicked",
                ))
            });

            tx.send(Message::Finished {
                unit: unit_id,
                attempt,
                outcome,
            })
            .await
            .ok();
        });

        self.in_flight.insert(
            id.clone(),
            InFlight {
                handle,
                cancel,
                phase_permit,
                task_permit,
            },
        );
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<Option<Halt>, TransitionError> {
        match message {
            Message::Finished {
                unit,
                attempt,
                outcome,
            } => {
                let Some(flight) = self.in_flight.remove(&unit) else {
                    return Ok(None);
                };
                drop(flight.task_permit);

                let halt = self.finish_unit(&unit, attempt, outcome).await?;

                // A leaf phase stays counted against the phase budget
                // while it backs off, like a phase whose tasks retry
                if let Some(permit) = flight.phase_permit
                    && self.retry_timers.contains_key(&unit)
                {
                    self.backoff_permits.insert(unit, permit);
                }
                Ok(halt)
            }
            Message::RetryDue { unit } => {
                if self.retry_timers.remove(&unit).is_some() {
                    let event = self.machine.apply(&unit, Transition::Requeue).await?;
                    self.observe(std::slice::from_ref(&event));
                }
                Ok(None)
            }
        }
    }

    async fn finish_unit(
        &mut self,
        unit: &UnitId,
        attempt: u32,
        outcome: ExecutionOutcome,
    ) -> Result<Option<Halt>, TransitionError> {
        if outcome.success {
            let event = self
                .machine
                .apply(
                    unit,
                    Transition::Succeed {
                        artifact: outcome.artifact,
                    },
                )
                .await?;
            self.observe(std::slice::from_ref(&event));
            tracing::info!(unit = %unit, attempt, "Unit completed");
            return Ok(None);
        }

        let error = outcome.into_error();
        self.machine
            .apply(
                unit,
                Transition::Fail {
                    error: error.clone(),
                },
            )
            .await?;

        if error.category == ErrorCategory::Cancelled {
            // Only produced when the executor gives up on its own
            tracing::warn!(unit = %unit, "Executor reported cancellation outside a halt");
            let event = self.machine.apply(unit, Transition::Abort).await?;
            self.observe(std::slice::from_ref(&event));
            return Ok(self.config.scheduler.fail_fast.then_some(Halt::FailFast));
        }

        let decision = self.recovery.decide(unit, &error);
        tracing::warn!(
            unit = %unit,
            attempt,
            category = %error.category,
            error = %error.message,
            ?decision,
            "Unit failed"
        );

        match decision {
            Decision::Retry { delay } => {
                self.machine.apply(unit, Transition::Retry { delay }).await?;
                let tx = self.tx.clone();
                let due = unit.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    tx.send(Message::RetryDue { unit: due }).await.ok();
                });
                self.retry_timers.insert(unit.clone(), timer);
                Ok(None)
            }
            Decision::Skip => {
                let event = self.machine.apply(unit, Transition::Skip).await?;
                self.observe(std::slice::from_ref(&event));
                Ok(None)
            }
            Decision::Abort => {
                let event = self.machine.apply(unit, Transition::Abort).await?;
                self.observe(std::slice::from_ref(&event));
                if self.config.scheduler.fail_fast {
                    tracing::error!(unit = %unit, "Unit aborted, halting run (fail-fast)");
                    return Ok(Some(Halt::FailFast));
                }
                Ok(None)
            }
        }
    }

    /// Cancel executions and timers, release permits and return running
    /// units to `Pending`.
    async fn stop_in_flight(&mut self) -> Result<(), TransitionError> {
        for (unit, flight) in self.in_flight.drain() {
            flight.cancel.cancel();
            flight.handle.abort();
            tracing::debug!(unit = %unit, "Execution interrupted");
        }
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
        self.active_phases.clear();
        self.backoff_permits.clear();

        let events = self.machine.interrupt_running().await?;
        if !events.is_empty() {
            tracing::info!(units = events.len(), "Interrupted in-flight units");
        }
        Ok(())
    }

    fn observe(&mut self, events: &[Event]) {
        if events.iter().any(|e| e.to.is_terminal()) {
            self.dirty = true;
        }
    }

    async fn checkpoint(&mut self) -> Checkpoint {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Checkpoint::new(
            self.run_id,
            sequence,
            self.graph.plan().clone(),
            self.machine.snapshot().await,
            self.recovery.counters().clone(),
            self.config.clone(),
        )
    }
}
