//! Executor that runs a unit's `command` payload through `sh -c`.

use async_trait::async_trait;
use serde::Deserialize;
use stagehand::{ErrorCategory, ExecutionContext, ExecutionOutcome, TaskExecutor, UnitError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Output kept in artifacts and error messages.
const OUTPUT_TAIL_CHARS: usize = 2000;

#[derive(Debug, Default, Deserialize)]
struct ShellPayload {
    command: Option<String>,
    #[serde(default)]
    permanent_exit_codes: Vec<i32>,
    #[serde(default)]
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome {
        let payload: ShellPayload = if ctx.unit.payload.is_null() {
            ShellPayload::default()
        } else {
            match serde_json::from_value(ctx.unit.payload.clone()) {
                Ok(p) => p,
                Err(e) => {
                    return ExecutionOutcome::failure(UnitError::permanent(format!(
                        "invalid payload: {e}"
                    )));
                }
            }
        };

        let Some(command) = payload.command else {
            return ExecutionOutcome::success();
        };

        tracing::debug!(unit = %ctx.unit.id, attempt = ctx.attempt, %command, "Spawning command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .envs(&payload.env)
            .env("STAGEHAND_UNIT", ctx.unit.id.as_str())
            .env("STAGEHAND_PHASE", &ctx.unit.phase)
            .env("STAGEHAND_ATTEMPT", ctx.attempt.to_string())
            .env("STAGEHAND_RUN_ID", ctx.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = payload.cwd {
            cmd.current_dir(cwd);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failure(UnitError::permanent(format!(
                    "failed to spawn `{command}`: {e}"
                )));
            }
        };

        // Dropping the wait future kills the child
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return ExecutionOutcome::failure(UnitError::new(
                    ErrorCategory::Cancelled,
                    "cancelled",
                ));
            }
            output = child.wait_with_output() => output,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return ExecutionOutcome::failure(UnitError::transient(format!(
                    "failed to wait for `{command}`: {e}"
                )));
            }
        };

        let stdout = tail(&String::from_utf8_lossy(&output.stdout));
        let stderr = tail(&String::from_utf8_lossy(&output.stderr));

        match output.status.code() {
            Some(0) => ExecutionOutcome::with_artifact(serde_json::json!({
                "exit_code": 0,
                "stdout": stdout,
            })),
            Some(code) => {
                let message = if stderr.is_empty() {
                    format!("exit code {code}")
                } else {
                    format!("exit code {code}: {stderr}")
                };
                if payload.permanent_exit_codes.contains(&code) {
                    ExecutionOutcome::failure(UnitError::permanent(message))
                } else {
                    ExecutionOutcome::failure(UnitError::transient(message))
                }
            }
            None => ExecutionOutcome::failure(UnitError::transient("terminated by signal")),
        }
    }
}

/// Last `OUTPUT_TAIL_CHARS` characters, trimmed.
fn tail(output: &str) -> String {
    let trimmed = output.trim();
    let count = trimmed.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand::UnitId;
    use stagehand::state::UnitKind;
    use stagehand::engine::UnitDescriptor;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(payload: serde_json::Value) -> ExecutionContext {
        ExecutionContext {
            run_id: Uuid::new_v4(),
            unit: UnitDescriptor {
                id: UnitId::task("build", "compile"),
                kind: UnitKind::Task,
                phase: "build".to_string(),
                name: None,
                payload,
            },
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_no_command_succeeds() {
        let outcome = ShellExecutor::new().execute(ctx(serde_json::Value::Null)).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let outcome = ShellExecutor::new()
            .execute(ctx(serde_json::json!({"command": "echo hello"})))
            .await;
        assert!(outcome.success);
        let artifact = outcome.artifact.unwrap();
        assert_eq!(artifact["stdout"], "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transient() {
        let outcome = ShellExecutor::new()
            .execute(ctx(serde_json::json!({"command": "exit 3"})))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().category, ErrorCategory::Transient);
    }

    #[tokio::test]
    async fn test_listed_exit_code_is_permanent() {
        let outcome = ShellExecutor::new()
            .execute(ctx(serde_json::json!({
                "command": "echo broken >&2; exit 2",
                "permanent_exit_codes": [2]
            })))
            .await;
        let error = outcome.error.unwrap();
        assert_eq!(error.category, ErrorCategory::Permanent);
        assert!(error.message.contains("broken"));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let outcome = ShellExecutor::new()
            .execute(ctx(serde_json::json!({
                "command": "echo $GREETING $STAGEHAND_UNIT",
                "env": {"GREETING": "hi"}
            })))
            .await;
        assert_eq!(outcome.artifact.unwrap()["stdout"], "hi build.compile");
    }

    #[tokio::test]
    async fn test_cancel_stops_command() {
        let context = ctx(serde_json::json!({"command": "sleep 30"}));
        let cancel = context.cancel.clone();
        let handle = tokio::spawn(async move { ShellExecutor::new().execute(context).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.error.unwrap().category, ErrorCategory::Cancelled);
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        let payload: Result<ShellPayload, _> =
            serde_json::from_value(serde_json::json!({"command": 5}));
        assert!(payload.is_err());
    }

    #[test]
    fn test_tail_keeps_end() {
        let long = "a".repeat(OUTPUT_TAIL_CHARS) + "end";
        let t = tail(&long);
        assert_eq!(t.chars().count(), OUTPUT_TAIL_CHARS);
        assert!(t.ends_with("end"));
    }
}
