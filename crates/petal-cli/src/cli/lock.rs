//! `petal verify` and `petal diff` over lock artifacts.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use petal_core::compiler::compose::DocumentSource;
use petal_core::lock::{Change, LockDiff, diff, load_lock, verify};
use petal_types::lock::LockFile;
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn handle_verify(state: &AppState, path: &Path, offline: bool) -> Result<ExitCode> {
    let lock = read(path).await?;
    let source: Option<&dyn DocumentSource> = if offline { None } else { Some(&state.source) };
    let report = verify(&lock, source);

    for finding in &report.findings {
        if finding.is_problem() {
            println!("error: {finding}");
        } else {
            println!("warning: {finding}");
        }
    }
    if report.is_ok() {
        println!("{}: ok ({})", path.display(), lock.spec_hash);
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

pub async fn handle_diff(old: &Path, new: &Path, as_json: bool) -> Result<ExitCode> {
    let changes = diff(&read(old).await?, &read(new).await?);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&diff_json(&changes))?);
    } else {
        for line in render(&changes) {
            println!("{line}");
        }
    }
    Ok(if changes.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn read(path: &Path) -> Result<LockFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    load_lock(&text).with_context(|| format!("invalid lock artifact {}", path.display()))
}

fn render(changes: &LockDiff) -> Vec<String> {
    if changes.is_empty() {
        return vec!["no differences".to_string()];
    }
    let mut lines = Vec::new();
    if changes.spec_hash_changed {
        lines.push("spec_hash changed".to_string());
    }
    for (id, change) in &changes.steps {
        lines.push(match change {
            Change::Added => format!("+ step {id}"),
            Change::Removed => format!("- step {id}"),
            Change::Changed(fields) => format!("~ step {id}: {}", fields.join(", ")),
        });
    }
    for (name, (before, after)) in &changes.params {
        lines.push(format!("~ param {name}: {} -> {}", show(before.as_ref()), show(after.as_ref())));
    }
    for (tag, (before, after)) in &changes.pins {
        lines.push(format!(
            "~ pin {tag}: {} -> {}",
            before.as_deref().unwrap_or("(none)"),
            after.as_deref().unwrap_or("(none)")
        ));
    }
    lines
}

fn show(value: Option<&Value>) -> String {
    value.map(Value::to_string).unwrap_or_else(|| "(none)".to_string())
}

fn diff_json(changes: &LockDiff) -> Value {
    let steps: serde_json::Map<String, Value> = changes
        .steps
        .iter()
        .map(|(id, change)| {
            let value = match change {
                Change::Added => json!("added"),
                Change::Removed => json!("removed"),
                Change::Changed(fields) => json!({"changed": fields}),
            };
            (id.clone(), value)
        })
        .collect();
    json!({
        "spec_hash_changed": changes.spec_hash_changed,
        "steps": steps,
        "params": changes.params.iter().map(|(k, (a, b))| (k.clone(), json!([a, b]))).collect::<serde_json::Map<_, _>>(),
        "pins": changes.pins.iter().map(|(k, (a, b))| (k.clone(), json!([a, b]))).collect::<serde_json::Map<_, _>>(),
    })
}
