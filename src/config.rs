//! Run configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables, then CLI flags (applied by the caller through the
//! `with_*` builders).
//!
//! # Configuration File Format
//!
//! ```toml
//! [scheduler]
//! max_concurrent_phases = 3
//! max_concurrent_tasks = 10
//! fail_fast = false
//! per_unit_timeout_ms = 600000
//! skipped_dependency = "cascade"
//!
//! [checkpoint]
//! interval_ms = 300000
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! multiplier = 2.0
//! max_delay_ms = 300000
//! jitter = 0.1
//! on_exhausted = "abort"
//!
//! [retry.classify]
//! permanent = "skip"
//!
//! [events]
//! buffer = 256
//! ```

use crate::recovery::{Classifier, Disposition, RetryPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for concurrency budgets and buffers, set by the semaphores
/// that enforce them.
pub const MAX_BUDGET: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// How a `Skipped` dependency affects its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkippedDependency {
    /// Dependents are skipped as well
    #[default]
    Cascade,
    /// A skipped dependency counts as done
    Satisfied,
}

impl std::fmt::Display for SkippedDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkippedDependency::Cascade => write!(f, "cascade"),
            SkippedDependency::Satisfied => write!(f, "satisfied"),
        }
    }
}

impl std::str::FromStr for SkippedDependency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cascade" => Ok(SkippedDependency::Cascade),
            "satisfied" => Ok(SkippedDependency::Satisfied),
            _ => anyhow::bail!(
                "Invalid skipped_dependency '{}'. Valid values: cascade, satisfied",
                s
            ),
        }
    }
}

/// Concurrency and failure handling for the run loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum phases active at once
    #[serde(default = "default_max_concurrent_phases")]
    pub max_concurrent_phases: usize,
    /// Maximum tasks running at once within one active phase
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Halt the whole run on the first aborted unit
    #[serde(default)]
    pub fail_fast: bool,
    /// Executor timeout per attempt; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_unit_timeout_ms: Option<u64>,
    #[serde(default)]
    pub skipped_dependency: SkippedDependency,
}

fn default_max_concurrent_phases() -> usize {
    3
}

fn default_max_concurrent_tasks() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_phases: default_max_concurrent_phases(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            fail_fast: false,
            per_unit_timeout_ms: None,
            skipped_dependency: SkippedDependency::default(),
        }
    }
}

/// Checkpoint cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Periodic save interval, on top of saves after each completion
    #[serde(default = "default_checkpoint_interval_ms")]
    pub interval_ms: u64,
}

fn default_checkpoint_interval_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_checkpoint_interval_ms(),
        }
    }
}

/// Category to disposition mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyConfig {
    #[serde(default = "default_retry")]
    pub transient: Disposition,
    #[serde(default = "default_retry")]
    pub timeout: Disposition,
    #[serde(default = "default_abort")]
    pub permanent: Disposition,
    #[serde(default = "default_retry")]
    pub unknown: Disposition,
}

fn default_retry() -> Disposition {
    Disposition::Retry
}

fn default_abort() -> Disposition {
    Disposition::Abort
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            transient: default_retry(),
            timeout: default_retry(),
            permanent: default_abort(),
            unknown: default_retry(),
        }
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Ceiling applied before jitter
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Relative jitter, e.g. 0.1 for +/-10%
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Action once retries are used up
    #[serde(default = "default_abort")]
    pub on_exhausted: Disposition,
    #[serde(default)]
    pub classify: ClassifyConfig,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            on_exhausted: default_abort(),
            classify: ClassifyConfig::default(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber buffer size
    #[serde(default = "default_event_buffer")]
    pub buffer: usize,
}

fn default_event_buffer() -> usize {
    crate::events::DEFAULT_EVENT_BUFFER
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer: default_event_buffer(),
        }
    }
}

/// Complete configuration of one run. Immutable once the run starts and
/// stored in every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl RunConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(content).context("Failed to parse config TOML")?;
        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("{}", problems.join("; "));
        }
        Ok(config)
    }

    /// Load the file if given, otherwise start from defaults; then apply
    /// environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `STAGEHAND_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("STAGEHAND_MAX_CONCURRENT_PHASES") {
            self.scheduler.max_concurrent_phases = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid STAGEHAND_MAX_CONCURRENT_PHASES '{value}'"))?;
        }
        if let Some(value) = lookup("STAGEHAND_MAX_CONCURRENT_TASKS") {
            self.scheduler.max_concurrent_tasks = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid STAGEHAND_MAX_CONCURRENT_TASKS '{value}'"))?;
        }
        if let Some(value) = lookup("STAGEHAND_FAIL_FAST") {
            self.scheduler.fail_fast = value != "false" && value != "0";
        }
        Ok(())
    }

    /// Check value ranges. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let budgets = [
            ("scheduler.max_concurrent_phases", self.scheduler.max_concurrent_phases),
            ("scheduler.max_concurrent_tasks", self.scheduler.max_concurrent_tasks),
        ];
        for (key, value) in budgets {
            if value == 0 {
                problems.push(format!("{key} must be at least 1"));
            } else if value > MAX_BUDGET {
                problems.push(format!("{key} must be at most {MAX_BUDGET}, got {value}"));
            }
        }
        if self.events.buffer > MAX_BUDGET {
            problems.push(format!(
                "events.buffer must be at most {MAX_BUDGET}, got {}",
                self.events.buffer
            ));
        }
        if self.retry.multiplier < 1.0 {
            problems.push(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            problems.push(format!(
                "retry.jitter must be in [0.0, 1.0), got {}",
                self.retry.jitter
            ));
        }
        if self.checkpoint.interval_ms == 0 {
            problems.push("checkpoint.interval_ms must be positive".to_string());
        }

        problems
    }

    pub fn with_max_concurrent_phases(mut self, n: usize) -> Self {
        self.scheduler.max_concurrent_phases = n;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.scheduler.max_concurrent_tasks = n;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.scheduler.fail_fast = fail_fast;
        self
    }

    pub fn with_per_unit_timeout(mut self, timeout: Duration) -> Self {
        self.scheduler.per_unit_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_skipped_dependency(mut self, policy: SkippedDependency) -> Self {
        self.scheduler.skipped_dependency = policy;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_retry_attempts(mut self, n: u32) -> Self {
        self.retry.max_attempts = n;
        self
    }

    /// Backoff base delay, multiplier and jitter in one call.
    pub fn with_backoff(mut self, base: Duration, multiplier: f64, jitter: f64) -> Self {
        self.retry.base_delay_ms = base.as_millis() as u64;
        self.retry.multiplier = multiplier;
        self.retry.jitter = jitter;
        self
    }

    pub fn per_unit_timeout(&self) -> Option<Duration> {
        self.scheduler.per_unit_timeout_ms.map(Duration::from_millis)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint.interval_ms)
    }

    /// The immutable retry policy for a run.
    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.retry;
        RetryPolicy {
            max_attempts: retry.max_attempts,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            multiplier: retry.multiplier,
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter: retry.jitter,
            on_exhausted: retry.on_exhausted,
            classifier: Classifier {
                transient: retry.classify.transient,
                timeout: retry.classify.timeout,
                permanent: retry.classify.permanent,
                unknown: retry.classify.unknown,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.scheduler.max_concurrent_phases, 3);
        assert_eq!(config.scheduler.max_concurrent_tasks, 10);
        assert_eq!(config.checkpoint_interval(), Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.scheduler.fail_fast);
        assert!(config.per_unit_timeout().is_none());
        assert_eq!(config.scheduler.skipped_dependency, SkippedDependency::Cascade);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let content = r#"
[scheduler]
max_concurrent_tasks = 4
skipped_dependency = "satisfied"

[retry.classify]
permanent = "skip"
"#;
        let config = RunConfig::parse(content).unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 4);
        assert_eq!(config.scheduler.max_concurrent_phases, 3);
        assert_eq!(
            config.scheduler.skipped_dependency,
            SkippedDependency::Satisfied
        );
        assert_eq!(config.retry.classify.permanent, Disposition::Skip);
        assert_eq!(config.retry.classify.transient, Disposition::Retry);
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let err = RunConfig::parse("[retry]\njitter = 1.5\n").unwrap_err();
        assert!(format!("{err:#}").contains("retry.jitter"));

        let err = RunConfig::parse("[scheduler]\nmax_concurrent_phases = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("max_concurrent_phases"));
    }

    #[test]
    fn test_parse_rejects_budgets_above_semaphore_limit() {
        let err = RunConfig::parse("[scheduler]\nmax_concurrent_tasks = 9223372036854775807\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("scheduler.max_concurrent_tasks must be at most"));

        let config = RunConfig::default().with_max_concurrent_phases(MAX_BUDGET + 1);
        assert_eq!(config.validate().len(), 1);
        assert!(
            RunConfig::default()
                .with_max_concurrent_phases(MAX_BUDGET)
                .validate()
                .is_empty()
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(&path, "[scheduler]\nper_unit_timeout_ms = 1500\n").unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.per_unit_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STAGEHAND_MAX_CONCURRENT_PHASES", "1"),
            ("STAGEHAND_MAX_CONCURRENT_TASKS", "2"),
            ("STAGEHAND_FAIL_FAST", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = RunConfig::default();
        config
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.scheduler.max_concurrent_phases, 1);
        assert_eq!(config.scheduler.max_concurrent_tasks, 2);
        assert!(config.scheduler.fail_fast);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = RunConfig::default();
        let err = config
            .apply_env_from(|k| (k == "STAGEHAND_MAX_CONCURRENT_TASKS").then(|| "many".into()))
            .unwrap_err();
        assert!(err.to_string().contains("STAGEHAND_MAX_CONCURRENT_TASKS"));
    }

    #[test]
    fn test_builders_and_policy() {
        let config = RunConfig::default()
            .with_max_retry_attempts(5)
            .with_backoff(Duration::from_millis(10), 3.0, 0.0);
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.multiplier, 3.0);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_skipped_dependency_from_str() {
        assert_eq!(
            "Satisfied".parse::<SkippedDependency>().unwrap(),
            SkippedDependency::Satisfied
        );
        assert!("sometimes".parse::<SkippedDependency>().is_err());
    }
}
