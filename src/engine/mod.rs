//! Engine entry points: start a run from a plan or resume one from a
//! checkpoint, and observe it through a [`RunHandle`].
//!
//! Each run owns its graph, state machine, event bus and configuration.
//! Several runs may execute in one process.

mod executor;
mod report;
mod scheduler;

pub use executor::{ExecutionContext, ExecutionOutcome, TaskExecutor, UnitDescriptor};
pub use report::{RunReport, RunStatus};

use crate::checkpoint::{CheckpointManager, CheckpointStore, MemoryCheckpointStore};
use crate::config::RunConfig;
use crate::dag::{PlanGraph, Resolver};
use crate::errors::EngineError;
use crate::events::{EventBus, EventStream};
use crate::plan::Plan;
use crate::recovery::RecoveryController;
use crate::state::StateMachine;
use scheduler::{RunSetup, Scheduler};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Handle to a running (or finished) run.
pub struct RunHandle {
    run_id: Uuid,
    bus: EventBus,
    cancel: CancellationToken,
    join: JoinHandle<Result<RunReport, EngineError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Events committed from now on. Earlier history is in the checkpoints.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Request cancellation. In-flight units are interrupted and a final
    /// checkpoint is written before [`wait`](Self::wait) returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunReport, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?
    }
}

/// Builds and launches runs.
#[derive(Clone)]
pub struct Engine {
    config: RunConfig,
    executor: Arc<dyn TaskExecutor>,
    checkpoints: CheckpointManager,
}

impl Engine {
    /// Engine with default configuration and in-memory checkpoints.
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            config: RunConfig::default(),
            executor,
            checkpoints: CheckpointManager::new(Arc::new(MemoryCheckpointStore::new())),
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = CheckpointManager::new(store);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Validate the plan and start a new run. Must be called inside a Tokio
    /// runtime.
    pub fn start(&self, plan: Plan) -> Result<RunHandle, EngineError> {
        self.start_observed(plan).map(|(handle, _)| handle)
    }

    /// Like [`start`](Self::start), with a subscription that sees every event
    /// of the run.
    pub fn start_observed(&self, plan: Plan) -> Result<(RunHandle, EventStream), EngineError> {
        check_config(&self.config)?;
        let graph = Arc::new(Resolver::resolve(&plan)?);
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(self.config.events.buffer);
        let machine = StateMachine::new(
            graph.clone(),
            bus.clone(),
            self.config.scheduler.skipped_dependency,
        );
        let recovery = RecoveryController::new(self.config.retry_policy());

        Ok(self.launch(run_id, graph, machine, recovery, self.config.clone(), 1))
    }

    /// Resume from a checkpoint id or `"latest"`. Completed units are not
    /// executed again; in-flight units start over.
    pub async fn resume(&self, selector: &str) -> Result<RunHandle, EngineError> {
        self.resume_observed(selector)
            .await
            .map(|(handle, _)| handle)
    }

    pub async fn resume_observed(
        &self,
        selector: &str,
    ) -> Result<(RunHandle, EventStream), EngineError> {
        let checkpoint = self
            .checkpoints
            .load(selector)
            .await
            .map_err(EngineError::Resume)?;
        let graph = Arc::new(checkpoint.resolve().map_err(EngineError::Resume)?);

        tracing::info!(
            run_id = %checkpoint.run_id,
            checkpoint = %checkpoint.id,
            completed = checkpoint.state.counts().completed,
            "Resuming run"
        );

        // The run keeps the configuration it was started with
        let config = checkpoint.config.clone();
        check_config(&config)?;
        let bus = EventBus::new(config.events.buffer);
        let machine = StateMachine::restore(
            graph.clone(),
            checkpoint.state,
            bus,
            config.scheduler.skipped_dependency,
        );
        let recovery = RecoveryController::with_counters(config.retry_policy(), checkpoint.recovery);

        Ok(self.launch(
            checkpoint.run_id,
            graph,
            machine,
            recovery,
            config,
            checkpoint.sequence + 1,
        ))
    }

    fn launch(
        &self,
        run_id: Uuid,
        graph: Arc<PlanGraph>,
        machine: StateMachine,
        recovery: RecoveryController,
        config: RunConfig,
        next_sequence: u64,
    ) -> (RunHandle, EventStream) {
        let bus = machine.bus().clone();
        let events = bus.subscribe();
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::new(RunSetup {
            run_id,
            graph,
            machine: Arc::new(machine),
            config,
            executor: self.executor.clone(),
            recovery,
            checkpoints: self.checkpoints.clone(),
            next_sequence,
            cancel: cancel.clone(),
        });

        let span = tracing::info_span!("run", run_id = %run_id);
        let join = tokio::spawn(scheduler.run().instrument(span));

        let handle = RunHandle {
            run_id,
            bus,
            cancel,
            join,
        };
        (handle, events)
    }
}

/// Reject configurations the scheduler cannot honour before any task is
/// spawned.
fn check_config(config: &RunConfig) -> Result<(), EngineError> {
    let problems = config.validate();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidConfig(problems))
    }
}
