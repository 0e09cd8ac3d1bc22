//! Parameter and variable resolution.
//!
//! Precedence for parameter values: declared default < profile < invocation
//! override. Vars are rendered once, in dependency order, against params,
//! env and the vars rendered before them.

use std::collections::{BTreeMap, BTreeSet};

use petal_types::document::RawDocument;
use petal_types::expr::Scope;
use petal_types::value_type::TypeTag;
use serde_json::Value;

use crate::context::LayeredContext;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::template::{Template, has_template, render_tree, templated_strings};

/// Resolve every declared parameter to a concrete value.
pub fn resolve_params(
    doc: &RawDocument,
    profile: &BTreeMap<String, Value>,
    overrides: &BTreeMap<String, Value>,
    diags: &mut Vec<Diagnostic>,
) -> BTreeMap<String, Value> {
    for (origin, values) in [("profile", profile), ("override", overrides)] {
        for name in values.keys() {
            if !doc.params.contains_key(name) {
                diags.push(Diagnostic::validation(
                    format!("params.{name}"),
                    format!("{origin} sets undeclared parameter '{name}'"),
                ));
            }
        }
    }

    let mut resolved = BTreeMap::new();
    for (name, param) in &doc.params {
        let spec = param.spec();
        let loc = format!("params.{name}");
        // Unknown tags are reported by the validator.
        let tag = TypeTag::parse(&spec.type_tag);

        let supplied = overrides.get(name).or_else(|| profile.get(name));
        let value = match (supplied, &spec.default) {
            (Some(v), _) => match coerce(tag, v) {
                Ok(v) => v,
                Err(message) => {
                    diags.push(Diagnostic::validation(&loc, message));
                    continue;
                }
            },
            (None, Some(default)) => default.clone(),
            (None, None) if spec.required => {
                diags.push(Diagnostic::validation(
                    &loc,
                    format!("required parameter '{name}' has no value"),
                ));
                continue;
            }
            (None, None) => Value::Null,
        };
        resolved.insert(name.clone(), value);
    }
    resolved
}

/// Coerce a supplied value to the declared type. Flat strings (from the
/// command line) are parsed; structured values must already match.
fn coerce(tag: Option<TypeTag>, value: &Value) -> Result<Value, String> {
    let Some(tag) = tag else {
        return Ok(value.clone());
    };
    match value {
        Value::String(raw) if !matches!(tag, TypeTag::String | TypeTag::Json) => tag.coerce(raw),
        other if tag.check(other) => Ok(other.clone()),
        other => Err(format!("{other} is not a valid {tag}")),
    }
}

/// Render `vars` in dependency order.
pub fn resolve_vars(
    vars: &BTreeMap<String, Value>,
    params: &BTreeMap<String, Value>,
    env: &BTreeMap<String, String>,
    diags: &mut Vec<Diagnostic>,
) -> BTreeMap<String, Value> {
    let mut deps: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for (name, value) in vars {
        let mut found = Vec::new();
        templated_strings(value, "", &mut found);
        let mut names = BTreeSet::new();
        for (_, source) in found {
            let Ok(template) = Template::parse(source) else {
                continue;
            };
            for r in template.references() {
                let head = r.head().unwrap_or_default();
                let is_var = match r.scope {
                    Scope::Vars => true,
                    // Params shadow vars for bare names.
                    Scope::Local => !params.contains_key(head) && vars.contains_key(head),
                    _ => false,
                };
                if is_var {
                    names.insert(head.to_string());
                }
            }
        }
        deps.insert(name.as_str(), names);
    }

    let mut done: BTreeMap<String, Value> = BTreeMap::new();
    let mut pending: Vec<&str> = vars.keys().map(String::as_str).collect();
    while !pending.is_empty() {
        let (ready, blocked): (Vec<&str>, Vec<&str>) = pending.iter().partition(|name| {
            deps[*name]
                .iter()
                .all(|d| done.contains_key(d) || !vars.contains_key(d))
        });
        if ready.is_empty() {
            diags.push(Diagnostic::error(
                DiagnosticKind::UndefinedReference,
                "vars",
                format!("vars reference each other in a cycle: {}", blocked.join(", ")),
            ));
            break;
        }
        for name in ready {
            let mut value = vars[name].clone();
            let has_templates = match &value {
                Value::String(s) => has_template(s),
                _ => true,
            };
            if has_templates {
                let ctx = LayeredContext::new().params(params).vars(&done).env(env);
                if let Err(errors) = render_tree(&mut value, &ctx, &[]) {
                    for (pointer, e) in errors {
                        diags.push(Diagnostic::error(
                            DiagnosticKind::UndefinedReference,
                            format!("vars.{name}{}", pointer.replace('/', ".")),
                            e.to_string(),
                        ));
                    }
                    continue;
                }
            }
            done.insert(name.to_string(), value);
        }
        pending = blocked;
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(yaml: &str) -> RawDocument {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn map(v: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_precedence_and_coercion() {
        let d = doc(r#"
name: p
params:
  mode: {type: string, default: dev}
  jobs: {type: int, default: 1}
  fast: bool
  target: {type: string, required: true}
"#);
        let mut diags = Vec::new();
        let params = resolve_params(
            &d,
            &map(json!({"mode": "ci", "jobs": 2})),
            &map(json!({"jobs": "8", "fast": "yes", "target": "linux"})),
            &mut diags,
        );
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(params["mode"], "ci");
        assert_eq!(params["jobs"], 8);
        assert_eq!(params["fast"], true);
        assert_eq!(params["target"], "linux");
    }

    #[test]
    fn test_missing_required_and_bad_values() {
        let d = doc(r#"
name: p
params:
  target: {type: string, required: true}
  jobs: int
"#);
        let mut diags = Vec::new();
        resolve_params(
            &d,
            &BTreeMap::new(),
            &map(json!({"jobs": "many", "ghost": 1})),
            &mut diags,
        );
        let text: Vec<String> = diags.iter().map(|d| d.to_string()).collect();
        assert_eq!(text.len(), 3, "{text:?}");
        assert!(text.iter().any(|t| t.contains("undeclared parameter 'ghost'")));
        assert!(text.iter().any(|t| t.contains("'many' is not an int")));
        assert!(text.iter().any(|t| t.contains("required parameter 'target'")));
    }

    #[test]
    fn test_vars_render_in_dependency_order() {
        let vars = map(json!({
            "out": "{{ vars.root }}/{{ target }}",
            "root": "/build/{{ env.USER }}",
            "list": ["{{ target }}", 2],
        }));
        let params = map(json!({"target": "arm"}));
        let env = BTreeMap::from([("USER".to_string(), "ci".to_string())]);
        let mut diags = Vec::new();
        let vars = resolve_vars(&vars, &params, &env, &mut diags);
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(vars["out"], "/build/ci/arm");
        assert_eq!(vars["list"], json!(["arm", 2]));
    }

    #[test]
    fn test_var_cycle() {
        let vars = map(json!({"a": "{{ vars.b }}", "b": "{{ a }}"}));
        let mut diags = Vec::new();
        resolve_vars(&vars, &BTreeMap::new(), &BTreeMap::new(), &mut diags);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("cycle: a, b"));
    }
}
