//! Static `foreach` expansion.
//!
//! A step with `foreach` becomes one instance per item, with ids
//! `{id}[{index}]` and `item`/`index` bound as render locals. The list must
//! be known at compile time: a literal, or a `params.*` / `vars.*` reference.

use std::collections::BTreeMap;

use petal_types::document::RawStep;
use petal_types::expr::Scope;
use serde_json::Value;

use crate::compiler::macros::MacroScope;
use crate::context::LayeredContext;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::expression::{lookup_path, parse_reference};
use crate::template::render_tree;

/// Expand every `foreach` step in `steps`.
pub fn expand_foreach(
    steps: Vec<RawStep>,
    scope: &MacroScope<'_>,
    diags: &mut Vec<Diagnostic>,
) -> Vec<RawStep> {
    let mut instances: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut out = Vec::with_capacity(steps.len());

    for step in steps {
        let Some(spec) = step.foreach.clone() else {
            out.push(step);
            continue;
        };
        let id = step.id().to_string();
        let loc = format!("steps.{id}.foreach");
        let Some(items) = resolve_items(&spec, &step, scope, &loc, diags) else {
            continue;
        };
        if items.is_empty() {
            diags.push(Diagnostic::warning(&loc, "foreach list is empty; step produces no instances"));
        }

        let mut ids = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut instance = step.clone();
            instance.foreach = None;
            instance.id = Some(format!("{id}[{index}]"));
            instance.bindings.insert("item".to_string(), item);
            instance.bindings.insert("index".to_string(), Value::from(index));
            ids.push(format!("{id}[{index}]"));
            out.push(instance);
        }
        instances.insert(id, ids);
    }

    if !instances.is_empty() {
        for step in &mut out {
            let mut needs = Vec::with_capacity(step.needs.len());
            for need in &step.needs {
                match instances.get(need) {
                    Some(ids) => needs.extend(ids.iter().cloned()),
                    None => needs.push(need.clone()),
                }
            }
            step.needs = needs;
        }
    }
    out
}

fn resolve_items(
    spec: &Value,
    step: &RawStep,
    scope: &MacroScope<'_>,
    loc: &str,
    diags: &mut Vec<Diagnostic>,
) -> Option<Vec<Value>> {
    match spec {
        Value::Array(_) => {
            let mut list = spec.clone();
            let ctx = LayeredContext::new()
                .bindings(&step.bindings)
                .params(scope.params)
                .vars(scope.vars)
                .env(scope.env);
            if let Err(errors) = render_tree(&mut list, &ctx, &[]) {
                for (pointer, e) in errors {
                    diags.push(Diagnostic::error(
                        DiagnosticKind::UndefinedReference,
                        format!("{loc}{}", pointer.replace('/', ".")),
                        e.to_string(),
                    ));
                }
                return None;
            }
            match list {
                Value::Array(items) => Some(items),
                _ => None,
            }
        }
        Value::String(source) => {
            let source = source
                .trim()
                .trim_start_matches("{{")
                .trim_end_matches("}}")
                .trim();
            let reference = match parse_reference(source) {
                Ok(r) => r,
                Err(e) => {
                    diags.push(Diagnostic::validation(loc, format!("bad foreach source '{source}': {e}")));
                    return None;
                }
            };
            let map = match reference.scope {
                Scope::Params => scope.params,
                Scope::Vars => scope.vars,
                _ => {
                    diags.push(Diagnostic::validation(
                        loc,
                        format!(
                            "foreach over '{reference}' is not static; use a list, params.* or vars.*"
                        ),
                    ));
                    return None;
                }
            };
            let value = reference
                .path
                .split_first()
                .and_then(|(head, rest)| map.get(head).and_then(|v| lookup_path(v, rest)));
            match value {
                Some(Value::Array(items)) => Some(items.clone()),
                Some(other) => {
                    diags.push(Diagnostic::validation(
                        loc,
                        format!("foreach source '{reference}' is not a list (got {other})"),
                    ));
                    None
                }
                None => {
                    diags.push(Diagnostic::error(
                        DiagnosticKind::UndefinedReference,
                        loc,
                        format!("undefined reference '{reference}'"),
                    ));
                    None
                }
            }
        }
        other => {
            diags.push(Diagnostic::validation(
                loc,
                format!("foreach expects a list or a reference, got {other}"),
            ));
            None
        }
    }
}
