//! Defaults injection.
//!
//! Keys are dotted paths. `<adapter>.<field>` targets the `with` payload of
//! steps using that adapter, an unprefixed adapter field targets every step
//! whose adapter accepts it, and `timeout`, `retry.*`, `cache`, `if_error`
//! and `resources.*` target the step itself. A value set on the step always
//! wins.

use std::collections::BTreeMap;

use petal_types::document::{RawCache, RawRetry, RawStep};
use petal_types::duration::PetalDuration;
use petal_types::step::{AdapterKind, ResourceHints};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::diagnostic::Diagnostic;

/// Apply `defaults` to every step.
pub fn apply_defaults(
    steps: &mut [RawStep],
    defaults: &BTreeMap<String, Value>,
    diags: &mut Vec<Diagnostic>,
) {
    for (key, value) in flatten(defaults) {
        let loc = format!("defaults.{key}");
        let applied = match key.split_once('.') {
            Some(("retry", field)) => apply_retry(steps, field, &value, &loc, diags),
            Some(("resources", field)) => apply_resources(steps, field, &value, &loc, diags),
            Some(("cache", "policy")) => apply_cache(steps, &value, &loc, diags),
            Some((tag, field)) => match AdapterKind::from_tag(tag) {
                Some(kind) if kind.config_fields().contains(&field) => {
                    set_with(steps, Some(kind), field, &value);
                    true
                }
                _ => false,
            },
            None => match key.as_str() {
                "timeout" => match parse::<PetalDuration>(&value, &loc, diags) {
                    Some(timeout) => {
                        for step in steps.iter_mut().filter(|s| s.timeout.is_none()) {
                            step.timeout = Some(timeout);
                        }
                        true
                    }
                    None => true,
                },
                "cache" => apply_cache(steps, &value, &loc, diags),
                "if_error" => match value.as_str() {
                    Some(policy) => {
                        for step in steps.iter_mut().filter(|s| s.if_error.is_none()) {
                            step.if_error = Some(policy.to_string());
                        }
                        true
                    }
                    None => false,
                },
                field if AdapterKind::ALL.iter().any(|k| k.config_fields().contains(&field)) => {
                    set_with(steps, None, field, &value);
                    true
                }
                _ => false,
            },
        };
        if !applied {
            diags.push(Diagnostic::warning(loc, format!("default '{key}' matches no step field")));
        }
    }
}

/// `{shell: {shell: bash}}` and `{"shell.shell": bash}` are the same default.
fn flatten(defaults: &BTreeMap<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in defaults {
        let groups = AdapterKind::from_tag(key).is_some() || matches!(key.as_str(), "retry" | "resources");
        match value {
            Value::Object(map) if groups => {
                for (field, inner) in map {
                    out.push((format!("{key}.{field}"), inner.clone()));
                }
            }
            _ => out.push((key.clone(), value.clone())),
        }
    }
    out
}

fn set_with(steps: &mut [RawStep], kind: Option<AdapterKind>, field: &str, value: &Value) {
    for step in steps.iter_mut() {
        let Some(step_kind) = step.uses.as_deref().and_then(AdapterKind::from_tag) else {
            continue;
        };
        let matches = match kind {
            Some(kind) => kind == step_kind,
            None => step_kind.config_fields().contains(&field),
        };
        if matches && !step.with.contains_key(field) {
            step.with.insert(field.to_string(), value.clone());
        }
    }
}

fn apply_cache(steps: &mut [RawStep], value: &Value, loc: &str, diags: &mut Vec<Diagnostic>) -> bool {
    let Some(policy) = value.as_str() else {
        diags.push(Diagnostic::validation(loc, "cache default must be a policy name"));
        return true;
    };
    for step in steps.iter_mut() {
        // Human gates keep their own rule.
        if step.cache.is_none() && step.uses.as_deref() != Some("human") {
            step.cache = Some(RawCache::Policy(policy.to_string()));
        }
    }
    true
}

fn apply_retry(
    steps: &mut [RawStep],
    field: &str,
    value: &Value,
    loc: &str,
    diags: &mut Vec<Diagnostic>,
) -> bool {
    let set: fn(&mut RawRetry, &Value) -> Option<bool> = match field {
        "max" => |r, v| fill(&mut r.max, v),
        "backoff" => |r, v| fill(&mut r.backoff, v),
        "delay" => |r, v| fill(&mut r.delay, v),
        "max_delay" => |r, v| fill(&mut r.max_delay, v),
        "jitter" => |r, v| fill(&mut r.jitter, v),
        _ => return false,
    };
    for step in steps.iter_mut() {
        let retry = step.retry.get_or_insert_with(RawRetry::default);
        if set(retry, value).is_none() {
            diags.push(Diagnostic::validation(loc, format!("invalid value {value}")));
            return true;
        }
    }
    true
}

fn apply_resources(
    steps: &mut [RawStep],
    field: &str,
    value: &Value,
    loc: &str,
    diags: &mut Vec<Diagnostic>,
) -> bool {
    let set: fn(&mut ResourceHints, &Value) -> Option<bool> = match field {
        "cpu" => |r, v| fill(&mut r.cpu, v),
        "mem" => |r, v| fill(&mut r.mem, v),
        "gpu" => |r, v| fill(&mut r.gpu, v),
        "network" => |r, v| fill(&mut r.network, v),
        _ => return false,
    };
    for step in steps.iter_mut() {
        let hints = step.resources.get_or_insert_with(ResourceHints::default);
        if set(hints, value).is_none() {
            diags.push(Diagnostic::validation(loc, format!("invalid value {value}")));
            return true;
        }
    }
    true
}

/// Set `slot` from `value` unless already set. `None` means the value has
/// the wrong shape.
fn fill<T: DeserializeOwned>(slot: &mut Option<T>, value: &Value) -> Option<bool> {
    if slot.is_some() {
        return Some(false);
    }
    let parsed = serde_json::from_value(value.clone()).ok()?;
    *slot = Some(parsed);
    Some(true)
}

fn parse<T: DeserializeOwned>(value: &Value, loc: &str, diags: &mut Vec<Diagnostic>) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            diags.push(Diagnostic::validation(loc, format!("invalid value {value}: {e}")));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(yaml: &str) -> Vec<RawStep> {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn defaults(v: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_step_values_win() {
        let mut s = steps(r#"
- {id: a, uses: shell, with: {run: x}}
- {id: b, uses: shell, with: {run: y, shell: zsh}, timeout: 5s}
- {id: c, uses: http, with: {url: "http://x"}}
"#);
        let mut diags = Vec::new();
        apply_defaults(
            &mut s,
            &defaults(json!({"shell.shell": "bash", "timeout": "60s", "cwd": "/src"})),
            &mut diags,
        );
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(s[0].with["shell"], "bash");
        assert_eq!(s[1].with["shell"], "zsh");
        assert_eq!(s[0].timeout, Some(PetalDuration::from_secs(60)));
        assert_eq!(s[1].timeout, Some(PetalDuration::from_secs(5)));
        assert_eq!(s[0].with["cwd"], "/src");
        // http has no cwd and is not a shell step.
        assert!(!s[2].with.contains_key("cwd"));
        assert!(!s[2].with.contains_key("shell"));
        assert_eq!(s[2].timeout, Some(PetalDuration::from_secs(60)));
    }

    #[test]
    fn test_nested_groups_and_policies() {
        let mut s = steps(r#"
- {id: a, uses: shell, with: {run: x}, retry: {max: 5}}
- {id: gate, uses: human}
"#);
        let mut diags = Vec::new();
        apply_defaults(
            &mut s,
            &defaults(json!({
                "retry": {"max": 1, "delay": "1s"},
                "resources": {"cpu": 2},
                "cache": "read-only",
                "if_error": "skip",
            })),
            &mut diags,
        );
        assert!(diags.is_empty(), "{diags:?}");
        let retry = s[0].retry.as_ref().unwrap();
        assert_eq!(retry.max, Some(5));
        assert_eq!(retry.delay, Some(PetalDuration::from_secs(1)));
        assert_eq!(s[0].resources.as_ref().unwrap().cpu, Some(2.0));
        assert!(matches!(&s[0].cache, Some(RawCache::Policy(p)) if p == "read-only"));
        assert!(s[1].cache.is_none());
        assert_eq!(s[1].if_error.as_deref(), Some("skip"));
    }

    #[test]
    fn test_unknown_defaults_warn() {
        let mut s = steps("- {id: a, uses: shell, with: {run: x}}\n");
        let mut diags = Vec::new();
        apply_defaults(
            &mut s,
            &defaults(json!({"colour": "red", "shell.image": "x", "retry.max": "lots"})),
            &mut diags,
        );
        assert_eq!(diags.len(), 3, "{diags:?}");
        assert_eq!(diags.iter().filter(|d| d.is_error()).count(), 1);
    }
}
