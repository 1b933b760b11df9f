use anyhow::Result;
use clap::{Parser, Subcommand};
use stagehand::logging::LogFormat;
use stagehand::ui::UiMode;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

/// Default location of checkpoint blobs, relative to the working directory.
const DEFAULT_CHECKPOINT_DIR: &str = ".stagehand/checkpoints";

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Dependency-aware build orchestration engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format: text, json
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a plan
    Run {
        /// Path to the plan file (JSON)
        #[arg(short, long)]
        plan: PathBuf,

        /// Path to a run configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for checkpoints
        #[arg(long, default_value = DEFAULT_CHECKPOINT_DIR)]
        checkpoint_dir: PathBuf,

        /// Maximum concurrently active phases
        #[arg(long)]
        max_phases: Option<usize>,

        /// Maximum concurrently running tasks per phase
        #[arg(long)]
        max_tasks: Option<usize>,

        /// Stop the run on the first aborted unit
        #[arg(long)]
        fail_fast: bool,

        /// UI output mode: full, minimal, json
        #[arg(long, value_enum, default_value = "full")]
        ui: UiMode,
    },
    /// Resume an interrupted run from a checkpoint
    Resume {
        /// Checkpoint id, or "latest"
        #[arg(long, default_value = "latest")]
        checkpoint: String,

        /// Directory for checkpoints
        #[arg(long, default_value = DEFAULT_CHECKPOINT_DIR)]
        checkpoint_dir: PathBuf,

        /// UI output mode: full, minimal, json
        #[arg(long, value_enum, default_value = "full")]
        ui: UiMode,
    },
    /// List stored checkpoints
    Checkpoints {
        /// Directory for checkpoints
        #[arg(long, default_value = DEFAULT_CHECKPOINT_DIR)]
        checkpoint_dir: PathBuf,
    },
    /// Show unit states recorded in a checkpoint
    Status {
        /// Checkpoint id, or "latest"
        #[arg(long, default_value = "latest")]
        checkpoint: String,

        /// Directory for checkpoints
        #[arg(long, default_value = DEFAULT_CHECKPOINT_DIR)]
        checkpoint_dir: PathBuf,
    },
    /// Validate a plan and print its execution order
    Graph {
        /// Path to the plan file (JSON)
        #[arg(short, long)]
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard =
        stagehand::logging::init(cli.verbose, cli.log_format, cli.log_file.as_deref())?;

    let success = match &cli.command {
        Commands::Run {
            plan,
            config,
            checkpoint_dir,
            max_phases,
            max_tasks,
            fail_fast,
            ui,
        } => {
            let overrides = cmd::RunOverrides {
                max_phases: *max_phases,
                max_tasks: *max_tasks,
                fail_fast: *fail_fast,
            };
            cmd::cmd_run(plan, config.as_deref(), checkpoint_dir, overrides, *ui).await?
        }
        Commands::Resume {
            checkpoint,
            checkpoint_dir,
            ui,
        } => cmd::cmd_resume(checkpoint, checkpoint_dir, *ui).await?,
        Commands::Checkpoints { checkpoint_dir } => {
            cmd::cmd_checkpoints(checkpoint_dir).await?;
            true
        }
        Commands::Status {
            checkpoint,
            checkpoint_dir,
        } => {
            cmd::cmd_status(checkpoint, checkpoint_dir).await?;
            true
        }
        Commands::Graph { plan } => {
            cmd::cmd_graph(plan)?;
            true
        }
    };

    if !success {
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}
