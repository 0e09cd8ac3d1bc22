//! Container adapter (`uses: container`).
//!
//! Invokes an existing container runtime (`docker run --rm ...`). The run
//! directory is mounted at [`CONTAINER_RUN_DIR`] and is the default working
//! directory. Resource hints map to runtime flags.

use std::path::Path;

use petal_core::adapter::{Adapter, AdapterContext, AdapterError, Outputs, ResolvedStep};
use petal_types::step::{AdapterConfig, AdapterKind, CaptureMode, ContainerConfig, ResourceHints};
use tokio::process::Command;
use tracing::Instrument;

use super::ADAPTER_VERSION;
use super::process::{input_env, process_outputs, run_command};

/// Mount point of the run directory inside the container.
pub const CONTAINER_RUN_DIR: &str = "/petal/run";

#[derive(Debug, Clone)]
pub struct ContainerAdapter {
    runtime: String,
}

impl ContainerAdapter {
    /// `runtime` is the binary used when a step does not name one.
    pub fn new(runtime: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
        }
    }
}

impl Adapter for ContainerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Container
    }

    fn version(&self) -> &str {
        ADAPTER_VERSION
    }

    async fn execute(&self, step: &ResolvedStep, ctx: &AdapterContext) -> Result<Outputs, AdapterError> {
        let AdapterConfig::Container(config) = &step.config else {
            return Err(AdapterError::Invalid(format!(
                "expected container config, got {}",
                step.config.kind()
            )));
        };
        let runtime = config.runtime.as_deref().unwrap_or(&self.runtime);
        let args = runtime_args(config, &step.resources, &ctx.run_dir, &input_env(step))?;
        tracing::debug!(runtime = %runtime, image = %config.image, "starting container");

        let mut command = Command::new(runtime);
        command.args(&args);
        let output = run_command(command, ctx).instrument(ctx.span.clone()).await?;
        process_outputs(&output, CaptureMode::Text)
    }
}

/// Arguments after the runtime binary.
fn runtime_args(
    config: &ContainerConfig,
    resources: &ResourceHints,
    run_dir: &Path,
    inputs: &[(String, String)],
) -> Result<Vec<String>, AdapterError> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-v".to_string(),
        format!("{}:{CONTAINER_RUN_DIR}", run_dir.display()),
        "-w".to_string(),
        config.workdir.clone().unwrap_or_else(|| CONTAINER_RUN_DIR.to_string()),
        "-e".to_string(),
        format!("PETAL_RUN_DIR={CONTAINER_RUN_DIR}"),
    ];
    for (key, value) in inputs.iter().map(|(k, v)| (k, v)).chain(config.env.iter()) {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    if let Some(cpu) = resources.cpu {
        args.push(format!("--cpus={cpu}"));
    }
    if let Some(mem) = &resources.mem {
        args.push(format!("--memory={}", memory_flag(mem)?));
    }
    if let Some(gpu) = resources.gpu.filter(|n| *n > 0) {
        args.push(format!("--gpus={gpu}"));
    }
    if resources.network == Some(false) {
        args.push("--network=none".to_string());
    }

    args.push(config.image.clone());
    if let Some(run) = &config.run {
        args.extend(["sh".to_string(), "-c".to_string(), run.clone()]);
    }
    Ok(args)
}

/// `512Mi` / `2Gi` / `2G` / `300m` to the runtime's `512m` / `2g` form.
fn memory_flag(mem: &str) -> Result<String, AdapterError> {
    let mem = mem.trim();
    let split = mem.find(|c: char| !c.is_ascii_digit()).unwrap_or(mem.len());
    let (number, unit) = mem.split_at(split);
    if number.is_empty() {
        return Err(AdapterError::Invalid(format!("invalid memory hint '{mem}'")));
    }
    let suffix = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => "b",
        "k" | "ki" | "kb" => "k",
        "m" | "mi" | "mb" => "m",
        "g" | "gi" | "gb" => "g",
        _ => return Err(AdapterError::Invalid(format!("invalid memory hint '{mem}'"))),
    };
    Ok(format!("{number}{suffix}"))
}
