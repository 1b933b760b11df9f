//! Tracing subscriber setup for the CLI.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter precedence: `STAGEHAND_LOG`, then `RUST_LOG`, then a default
/// derived from verbosity.
fn build_filter(verbose: bool) -> Result<EnvFilter> {
    for var in ["STAGEHAND_LOG", "RUST_LOG"] {
        if let Ok(value) = std::env::var(var)
            && !value.trim().is_empty()
        {
            return EnvFilter::try_new(&value)
                .with_context(|| format!("Invalid log filter in {var}: {value}"));
        }
    }
    let level = if verbose { "stagehand=debug,info" } else { "warn" };
    EnvFilter::try_new(level).context("Invalid default log filter")
}

/// Install the global subscriber. Logs go to stderr, or to `log_file`
/// through a non-blocking writer when given.
///
/// The returned guard flushes the file writer when dropped; hold it until
/// the process is about to exit.
pub fn init(
    verbose: bool,
    format: LogFormat,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(verbose)?;

    let mut guard = None;
    let file_writer = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            Some(non_blocking)
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter);

    match (format, file_writer) {
        (LogFormat::Text, None) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Json, None) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Text, Some(writer)) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .try_init(),
        (LogFormat::Json, Some(writer)) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
