//! Advisory reads/writes inference.
//!
//! Nothing here affects scheduling: `needs` and explicit `inputs` remain the
//! only edges. Reads and writes feed `explain`-style output and warnings.

use std::collections::{BTreeMap, BTreeSet};

use petal_types::document::RawStep;
use petal_types::expr::{Reference, Scope};
use petal_types::step::AdapterKind;
use serde_json::Value;

use crate::diagnostic::Diagnostic;
use crate::schema::ValidatedStep;

/// Name a reference the way `reads` lists it: `outputs.<step>`,
/// `params.<name>` or `vars.<name>`.
pub fn read_name(
    reference: &Reference,
    step: &RawStep,
    params: &BTreeMap<String, Value>,
    vars: &BTreeMap<String, Value>,
) -> Option<String> {
    let head = reference.head()?;
    let scoped = |id: &str| step.aliases.get(id).cloned().unwrap_or_else(|| id.to_string());
    match reference.scope {
        Scope::Outputs => Some(format!("outputs.{}", scoped(head))),
        Scope::Params => Some(format!("params.{head}")),
        Scope::Vars => Some(format!("vars.{head}")),
        Scope::Local => {
            if step.bindings.contains_key(head) || step.inputs.contains_key(head) {
                None
            } else if params.contains_key(head) {
                Some(format!("params.{head}"))
            } else if vars.contains_key(head) {
                Some(format!("vars.{head}"))
            } else {
                let id = scoped(head);
                step.needs.contains(&id).then(|| format!("outputs.{id}"))
            }
        }
        Scope::Env | Scope::Secrets | Scope::Inputs => None,
    }
}

/// Explicit `writes`, or the adapter contract plus declared outputs.
pub fn infer_writes(step: &ValidatedStep) -> Vec<String> {
    let names: BTreeSet<String> = match &step.raw.writes {
        Some(explicit) => explicit.iter().cloned().collect(),
        None => step
            .uses
            .output_contract()
            .iter()
            .map(|s| s.to_string())
            .chain(step.outputs.keys().cloned())
            .collect(),
    };
    names.into_iter().collect()
}

/// Warn about declared outputs the adapter has no way to produce.
pub fn advise(step: &ValidatedStep, config: &Value) -> Vec<Diagnostic> {
    let contract = step.uses.output_contract();
    let open_ended = match step.uses {
        AdapterKind::Shell | AdapterKind::Container => {
            config.get("capture").and_then(Value::as_str) == Some("json")
        }
        _ => false,
    };
    if open_ended {
        return Vec::new();
    }
    step.outputs
        .iter()
        .filter(|(name, spec)| !contract.contains(&name.as_str()) && spec.path.is_none())
        .map(|(name, _)| {
            Diagnostic::warning(
                format!("steps.{}.outputs.{name}", step.id()),
                format!(
                    "{} steps only produce {}; '{name}' will be missing",
                    step.uses,
                    contract.join(", ")
                ),
            )
        })
        .collect()
}
