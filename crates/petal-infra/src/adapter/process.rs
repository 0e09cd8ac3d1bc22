//! Local process adapter (`uses: shell`).
//!
//! Runs `run` through `shell -c` in the run directory (or `cwd` under it).
//! Step inputs are exported as `PETAL_INPUT_<NAME>`; the run directory as
//! `PETAL_RUN_DIR`. The child is killed when the step is cancelled or times
//! out.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use petal_core::adapter::{Adapter, AdapterContext, AdapterError, Outputs, ResolvedStep};
use petal_types::step::{AdapterConfig, AdapterKind, CaptureMode};
use serde_json::Value;
use tokio::process::Command;
use tracing::Instrument;

use super::ADAPTER_VERSION;

#[derive(Debug, Clone, Default)]
pub struct ProcessAdapter;

impl ProcessAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Adapter for ProcessAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Shell
    }

    fn version(&self) -> &str {
        ADAPTER_VERSION
    }

    async fn execute(&self, step: &ResolvedStep, ctx: &AdapterContext) -> Result<Outputs, AdapterError> {
        let AdapterConfig::Shell(config) = &step.config else {
            return Err(AdapterError::Invalid(format!("expected shell config, got {}", step.config.kind())));
        };

        let mut command = Command::new(&config.shell);
        command
            .arg("-c")
            .arg(&config.run)
            .current_dir(working_dir(&ctx.run_dir, config.cwd.as_deref()))
            .envs(&ctx.env)
            .envs(input_env(step))
            .envs(&config.env)
            .env("PETAL_RUN_DIR", &ctx.run_dir)
            .env("PETAL_RUN_ID", ctx.run_id.to_string())
            .env("PETAL_STEP_ID", &step.id);

        let output = run_command(command, ctx).instrument(ctx.span.clone()).await?;
        process_outputs(&output, config.capture)
    }
}

/// `cwd` relative to the run directory, or the run directory itself.
fn working_dir(run_dir: &Path, cwd: Option<&str>) -> PathBuf {
    match cwd {
        Some(cwd) => run_dir.join(cwd),
        None => run_dir.to_path_buf(),
    }
}

/// Inputs as `PETAL_INPUT_<NAME>` variables. Strings are passed raw, other
/// values as JSON.
pub(crate) fn input_env(step: &ResolvedStep) -> Vec<(String, String)> {
    step.inputs
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(name, value)| {
            let var: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("PETAL_INPUT_{var}"), text)
        })
        .collect()
}

/// Spawn, wait and collect output. The child dies with the future.
pub(crate) async fn run_command(mut command: Command, ctx: &AdapterContext) -> Result<Output, AdapterError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let child = command
        .spawn()
        .map_err(|e| AdapterError::Failed(format!("failed to spawn {program}: {e}")))?;
    tracing::debug!(program = %program, pid = ?child.id(), "spawned process");

    tokio::select! {
        output = child.wait_with_output() => {
            output.map_err(|e| AdapterError::Failed(format!("failed to wait for {program}: {e}")))
        }
        _ = ctx.cancel.cancelled() => Err(AdapterError::Cancelled),
    }
}

/// `stdout`, `stderr`, `exit_code`, plus the keys of a JSON object on stdout
/// in `json` capture mode. A non-zero exit is a failure.
pub(crate) fn process_outputs(output: &Output, capture: CaptureMode) -> Result<Outputs, AdapterError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let code = output.status.code();

    if !output.status.success() {
        let tail: String = {
            let trimmed = stderr.trim();
            let skip = trimmed.chars().count().saturating_sub(500);
            trimmed.chars().skip(skip).collect()
        };
        let status = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
        return Err(AdapterError::Failed(format!("exited with status {status}: {tail}")));
    }

    let mut outputs = Outputs::new();
    if capture == CaptureMode::Json {
        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(Value::Object(map)) => outputs.extend(map),
            Ok(_) => return Err(AdapterError::Failed("stdout is not a JSON object".to_string())),
            Err(e) => return Err(AdapterError::Failed(format!("stdout is not valid JSON: {e}"))),
        }
    }
    outputs.insert("stdout".to_string(), Value::String(stdout));
    outputs.insert("stderr".to_string(), Value::String(stderr));
    outputs.insert("exit_code".to_string(), Value::from(code.unwrap_or(0)));
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_types::step::ProcessConfig;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn step(run: &str, capture: CaptureMode) -> ResolvedStep {
        ResolvedStep {
            id: "proc".to_string(),
            config: AdapterConfig::Shell(ProcessConfig {
                run: run.to_string(),
                shell: "sh".to_string(),
                cwd: None,
                env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
                capture,
            }),
            inputs: BTreeMap::from([("target-name".to_string(), json!("world"))]),
            outputs: BTreeMap::new(),
            resources: Default::default(),
            attempt: 1,
        }
    }

    fn ctx(dir: &TempDir) -> AdapterContext {
        AdapterContext {
            run_id: Uuid::now_v7(),
            run_dir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
            cancel: CancellationToken::new(),
            span: tracing::Span::none(),
        }
    }

    #[tokio::test]
    async fn test_runs_in_run_dir_with_inputs() {
        let dir = TempDir::new().unwrap();
        let out = ProcessAdapter::new()
            .execute(
                &step("echo \"$GREETING $PETAL_INPUT_TARGET_NAME\" > out.txt; cat out.txt", CaptureMode::Text),
                &ctx(&dir),
            )
            .await
            .unwrap();
        assert_eq!(out["stdout"], "hello world\n");
        assert_eq!(out["exit_code"], 0);
        assert!(dir.path().join("out.txt").is_file());
    }

    #[tokio::test]
    async fn test_json_capture_merges_keys() {
        let dir = TempDir::new().unwrap();
        let out = ProcessAdapter::new()
            .execute(&step(r#"echo '{"count": 3}'"#, CaptureMode::Json), &ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out["count"], 3);
        assert!(out.contains_key("stdout"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_with_stderr() {
        let dir = TempDir::new().unwrap();
        let err = ProcessAdapter::new()
            .execute(&step("echo broken >&2; exit 3", CaptureMode::Text), &ctx(&dir))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::Failed("exited with status 3: broken".to_string()));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_child() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = ProcessAdapter::new()
            .execute(&step("sleep 10", CaptureMode::Text), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::Cancelled);
    }
}
