//! Checkpoint inspection - `stagehand checkpoints` and `stagehand status`.

use anyhow::{Context, Result};
use console::style;
use stagehand::UnitState;
use stagehand::checkpoint::{CheckpointManager, FileCheckpointStore};
use std::path::Path;
use std::sync::Arc;

fn manager(checkpoint_dir: &Path) -> CheckpointManager {
    CheckpointManager::new(Arc::new(FileCheckpointStore::new(checkpoint_dir)))
}

pub async fn cmd_checkpoints(checkpoint_dir: &Path) -> Result<()> {
    let metas = manager(checkpoint_dir)
        .list()
        .await
        .with_context(|| format!("Failed to list checkpoints in {}", checkpoint_dir.display()))?;

    if metas.is_empty() {
        println!("No checkpoints found in {}", checkpoint_dir.display());
        return Ok(());
    }

    println!();
    println!("{}", style("Checkpoints").bold().cyan());
    println!("─────────────────────────");
    for meta in &metas {
        let progress = format!("{}/{}", meta.counts.terminal(), meta.counts.total());
        let state = if meta.finished {
            style("finished").green()
        } else {
            style("resumable").yellow()
        };
        println!(
            "  {}  {}  {:>7}  {}  {}",
            meta.id,
            meta.created_at.format("%Y-%m-%d %H:%M:%S"),
            progress,
            state,
            meta.plan_name.as_deref().unwrap_or("")
        );
    }
    println!();
    println!("{} checkpoint(s)", metas.len());

    Ok(())
}

pub async fn cmd_status(selector: &str, checkpoint_dir: &Path) -> Result<()> {
    let checkpoint = manager(checkpoint_dir)
        .load(selector)
        .await
        .with_context(|| format!("Failed to load checkpoint '{}'", selector))?;
    let counts = checkpoint.state.counts();

    println!();
    println!("{}", style("Run Status").bold().cyan());
    println!("─────────────────────────");
    println!("Run: {}", checkpoint.run_id);
    println!("Checkpoint: {}", checkpoint.id);
    println!("Taken: {}", checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(ref name) = checkpoint.plan.name {
        println!("Plan: {}", name);
    }
    println!();
    println!(
        "Units: {} completed, {} skipped, {} aborted, {} pending ({} total)",
        counts.completed,
        counts.skipped,
        counts.aborted,
        counts.total() - counts.terminal(),
        counts.total()
    );
    println!();

    for record in checkpoint.state.records() {
        let state = match record.state {
            UnitState::Completed => style(record.state.to_string()).green(),
            UnitState::Aborted => style(record.state.to_string()).red(),
            UnitState::Skipped => style(record.state.to_string()).dim(),
            _ => style(record.state.to_string()).yellow(),
        };
        let indent = if record.phase.is_some() { "    " } else { "  " };
        print!("{}{:<24} {:<10} attempts={}", indent, record.id, state, record.attempts);
        if let Some(ref error) = record.last_error {
            print!("  {}", style(error).red());
        }
        println!();
    }

    Ok(())
}
