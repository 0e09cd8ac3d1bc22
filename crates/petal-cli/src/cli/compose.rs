//! `petal compose`: compile a document into a lock artifact.

use std::path::Path;

use anyhow::{Context, Result};
use petal_core::compiler::{CompileRequest, compile};
use petal_core::lock::to_pretty_json;
use petal_types::lock::LockFile;

use super::{CompileArgs, ComposeArgs};
use crate::state::AppState;

pub async fn handle_compose(state: &AppState, args: &ComposeArgs) -> Result<std::process::ExitCode> {
    let lock = compile_document(state, &args.document, &args.compile)?;
    let json = to_pretty_json(&lock)?;

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, format!("{json}\n"))
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "wrote {} ({} steps, {} layers, spec_hash {})",
                path.display(),
                lock.steps.len(),
                lock.layers.len(),
                lock.spec_hash
            );
        }
        None => println!("{json}"),
    }
    Ok(std::process::ExitCode::SUCCESS)
}

/// Compile `document` with the registered adapters' versions as pins.
/// Warnings are logged; compile errors carry every diagnostic of the
/// failing phase.
pub fn compile_document(state: &AppState, document: &Path, args: &CompileArgs) -> Result<LockFile> {
    let request = CompileRequest {
        root: state.document_ref(document),
        overlays: args.overlays.iter().map(|p| state.document_ref(p)).collect(),
        profile: args.profile.clone(),
        params: args.params.iter().cloned().collect(),
        env: std::env::vars().collect(),
        pins: state.registry.pins(),
    };

    let output = compile(&request, &state.source)
        .with_context(|| format!("failed to compile {}", document.display()))?;
    for warning in &output.warnings {
        tracing::warn!(location = %warning.location, "{}", warning.message);
    }
    Ok(output.lock)
}
