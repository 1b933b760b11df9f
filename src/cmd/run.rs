//! Plan execution - `stagehand run` and `stagehand resume`.

use anyhow::{Context, Result};
use stagehand::checkpoint::FileCheckpointStore;
use stagehand::dag::Resolver;
use stagehand::ui::{RunUI, UiMode, print_report};
use stagehand::{Engine, EventStream, Plan, RunConfig, RunHandle};
use std::path::Path;
use std::sync::Arc;

use super::shell::ShellExecutor;

/// Command-line overrides applied on top of file and environment config.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunOverrides {
    pub max_phases: Option<usize>,
    pub max_tasks: Option<usize>,
    pub fail_fast: bool,
}

fn build_engine(config: RunConfig, checkpoint_dir: &Path) -> Engine {
    Engine::new(Arc::new(ShellExecutor::new()))
        .with_config(config)
        .with_store(Arc::new(FileCheckpointStore::new(checkpoint_dir)))
}

/// Returns whether the run succeeded.
pub async fn cmd_run(
    plan_path: &Path,
    config_path: Option<&Path>,
    checkpoint_dir: &Path,
    overrides: RunOverrides,
    ui: UiMode,
) -> Result<bool> {
    let plan = Plan::load(plan_path)?;

    let mut config = RunConfig::resolve(config_path)?;
    if let Some(n) = overrides.max_phases {
        config = config.with_max_concurrent_phases(n);
    }
    if let Some(n) = overrides.max_tasks {
        config = config.with_max_concurrent_tasks(n);
    }
    if overrides.fail_fast {
        config = config.with_fail_fast(true);
    }
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    let graph = Resolver::resolve(&plan)
        .with_context(|| format!("Invalid plan: {}", plan_path.display()))?;
    let run_ui = RunUI::new(&graph, 0, ui);

    let engine = build_engine(config, checkpoint_dir);
    let (handle, events) = engine.start_observed(plan)?;
    tracing::info!(run_id = %handle.run_id(), plan = %plan_path.display(), "Run started");

    drive(handle, events, run_ui, ui).await
}

/// Returns whether the resumed run succeeded.
pub async fn cmd_resume(selector: &str, checkpoint_dir: &Path, ui: UiMode) -> Result<bool> {
    // Stored config wins on resume
    let engine = build_engine(RunConfig::default(), checkpoint_dir);

    let checkpoint = engine
        .checkpoints()
        .load(selector)
        .await
        .with_context(|| format!("Failed to load checkpoint '{}'", selector))?;
    let graph = checkpoint
        .resolve()
        .with_context(|| format!("Checkpoint {} is not resumable", checkpoint.id))?;
    let run_ui = RunUI::new(&graph, checkpoint.state.counts().terminal(), ui);

    if ui != UiMode::Json {
        println!(
            "Resuming run {} from checkpoint {}",
            checkpoint.run_id, checkpoint.id
        );
    }

    let (handle, events) = engine.resume_observed(&checkpoint.id).await?;
    drive(handle, events, run_ui, ui).await
}

async fn drive(handle: RunHandle, events: EventStream, run_ui: RunUI, ui: UiMode) -> Result<bool> {
    let display = tokio::spawn(run_ui.drive(events));

    let cancel = handle.cancellation_token();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let result = handle.wait().await;
    signal.abort();
    let _ = display.await;

    let report = result.context("Run failed")?;

    if ui == UiMode::Json {
        println!(
            "{}",
            serde_json::to_string(&report).context("Failed to serialize run report")?
        );
    } else {
        print_report(&report);
    }

    Ok(report.status.is_success())
}
