//! Schema validation of a composed, expanded document.
//!
//! Validation is pure and total: it inspects structure only, never renders a
//! template or runs user code, and reports every problem it finds.

use std::collections::{BTreeMap, BTreeSet};

use petal_types::document::{FORMAT_VERSION, RawDocument, RawStep};
use petal_types::expr::{Reference, Scope};
use petal_types::step::{
    AdapterKind, CachePolicy, CacheSettings, ErrorPolicy, OutputSpec, ResourceHints, RetryPolicy,
};
use petal_types::value_type::TypeTag;
use serde_json::Value;

use crate::diagnostic::Diagnostic;
use crate::expression::parse_reference;
use crate::template::has_template;

/// A declared parameter with a known type.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub type_tag: TypeTag,
    pub required: bool,
    pub default: Option<Value>,
    pub help: Option<String>,
}

/// An input declaration with its source parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedInput {
    pub from: Option<Reference>,
    pub value: Option<Value>,
    pub type_tag: TypeTag,
    pub required: bool,
}

/// A step whose enums, tags and policies are known to be well-formed.
/// Template strings are still unrendered.
#[derive(Debug, Clone)]
pub struct ValidatedStep {
    pub raw: RawStep,
    pub uses: AdapterKind,
    pub inputs: BTreeMap<String, ValidatedInput>,
    pub outputs: BTreeMap<String, OutputSpec>,
    pub cache: CacheSettings,
    pub retry: RetryPolicy,
    pub if_error: ErrorPolicy,
    pub resources: ResourceHints,
}

impl ValidatedStep {
    pub fn id(&self) -> &str {
        self.raw.id()
    }

    /// Same rule as [`petal_types::step::CanonicalStep::may_skip`].
    pub fn may_skip(&self) -> bool {
        self.raw.condition.is_some() || self.if_error == ErrorPolicy::Skip
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedDocument {
    pub name: String,
    pub description: Option<String>,
    pub params: BTreeMap<String, ParamDecl>,
    pub secrets: Vec<String>,
    pub steps: Vec<ValidatedStep>,
    /// Non-fatal findings.
    pub warnings: Vec<Diagnostic>,
}

/// Validate parameter declarations only.
pub fn validate_params(doc: &RawDocument, diags: &mut Vec<Diagnostic>) -> BTreeMap<String, ParamDecl> {
    let mut out = BTreeMap::new();
    for (name, param) in &doc.params {
        let spec = param.spec();
        let loc = format!("params.{name}");
        let Some(type_tag) = TypeTag::parse(&spec.type_tag) else {
            diags.push(Diagnostic::validation(
                &loc,
                format!("unknown type '{}' (expected one of {})", spec.type_tag, type_list()),
            ));
            continue;
        };
        if let Some(default) = &spec.default {
            if !type_tag.check(default) {
                diags.push(Diagnostic::validation(
                    &loc,
                    format!("default {default} is not a valid {type_tag}"),
                ));
            }
        }
        out.insert(
            name.clone(),
            ParamDecl {
                type_tag,
                required: spec.required,
                default: spec.default,
                help: spec.help,
            },
        );
    }
    out
}

/// Validate a document whose macros and `foreach` have been expanded.
pub fn validate(doc: &RawDocument) -> Result<ValidatedDocument, Vec<Diagnostic>> {
    let mut diags = Vec::new();

    match doc.petal.as_deref() {
        None | Some(FORMAT_VERSION) => {}
        Some(other) => diags.push(Diagnostic::validation(
            "petal",
            format!("unsupported format version '{other}' (expected '{FORMAT_VERSION}')"),
        )),
    }
    if doc.name.trim().is_empty() {
        diags.push(Diagnostic::validation("name", "document needs a name"));
    }

    let params = validate_params(doc, &mut diags);

    let mut seen = BTreeSet::new();
    for secret in &doc.secrets {
        if !seen.insert(secret.as_str()) {
            diags.push(Diagnostic::warning("secrets", format!("secret '{secret}' listed twice")));
        }
    }

    let mut ids: BTreeSet<&str> = BTreeSet::new();
    for step in &doc.steps {
        if !step.id().is_empty() && !ids.insert(step.id()) {
            diags.push(Diagnostic::validation(
                format!("steps.{}", step.id()),
                format!("duplicate step id '{}'", step.id()),
            ));
        }
    }

    let steps: Vec<ValidatedStep> = doc
        .steps
        .iter()
        .enumerate()
        .filter_map(|(index, step)| validate_step(step, index, doc, &ids, &mut diags))
        .collect();

    if diags.iter().any(Diagnostic::is_error) {
        return Err(diags);
    }
    Ok(ValidatedDocument {
        name: doc.name.clone(),
        description: doc.description.clone(),
        params,
        secrets: doc.secrets.clone(),
        steps,
        warnings: diags,
    })
}

fn validate_step(
    step: &RawStep,
    index: usize,
    doc: &RawDocument,
    ids: &BTreeSet<&str>,
    diags: &mut Vec<Diagnostic>,
) -> Option<ValidatedStep> {
    let id = step.id();
    let loc = if id.is_empty() {
        format!("steps[{index}]")
    } else {
        format!("steps.{id}")
    };
    let before = diags.iter().filter(|d| d.is_error()).count();

    if id.is_empty() {
        diags.push(Diagnostic::validation(&loc, "step has no id"));
    } else if id.chars().any(char::is_whitespace) {
        diags.push(Diagnostic::validation(&loc, "step ids cannot contain whitespace"));
    }
    if step.call.is_some() {
        diags.push(Diagnostic::validation(&loc, "unexpanded macro call"));
    }

    let uses = match step.uses.as_deref() {
        None => {
            diags.push(Diagnostic::validation(&loc, "step needs 'uses' (or 'call' for a macro)"));
            None
        }
        Some(tag) => {
            let kind = AdapterKind::from_tag(tag);
            if kind.is_none() {
                let known: Vec<&str> = AdapterKind::ALL.iter().map(AdapterKind::tag).collect();
                diags.push(Diagnostic::validation(
                    format!("{loc}.uses"),
                    format!("unknown adapter '{tag}' (expected one of {})", known.join(", ")),
                ));
            }
            kind
        }
    };

    let mut needs_seen = BTreeSet::new();
    for need in &step.needs {
        if !needs_seen.insert(need.as_str()) {
            diags.push(Diagnostic::warning(format!("{loc}.needs"), format!("'{need}' listed twice")));
        } else if need == id {
            diags.push(Diagnostic::validation(format!("{loc}.needs"), "a step cannot need itself"));
        } else if !ids.contains(need.as_str()) {
            diags.push(Diagnostic::validation(
                format!("{loc}.needs"),
                format!("unknown step '{need}'"),
            ));
        }
    }

    if let Some(kind) = uses {
        let fields = kind.config_fields();
        for key in step.with.keys() {
            if !fields.contains(&key.as_str()) {
                diags.push(Diagnostic::validation(
                    format!("{loc}.with.{key}"),
                    format!("'{key}' is not a {kind} setting (expected one of {})", fields.join(", ")),
                ));
            }
        }
        for required in kind.required_fields() {
            if !step.with.contains_key(*required) {
                diags.push(Diagnostic::validation(
                    format!("{loc}.with"),
                    format!("{kind} steps require '{required}'"),
                ));
            }
        }
    }

    let inputs = validate_inputs(step, &loc, diags);
    let outputs = validate_outputs(step, &loc, diags);
    let cache = validate_cache(step, uses, &loc, diags);
    let retry = validate_retry(step, &loc, diags);

    let if_error = match step.if_error.as_deref() {
        None | Some("fail") => ErrorPolicy::Fail,
        Some("skip") => ErrorPolicy::Skip,
        Some(other) => {
            diags.push(Diagnostic::validation(
                format!("{loc}.if_error"),
                format!("unknown error policy '{other}' (expected fail or skip)"),
            ));
            ErrorPolicy::Fail
        }
    };

    let resources = step.resources.clone().unwrap_or_default();
    if let Some(cpu) = resources.cpu {
        if !(cpu > 0.0 && cpu.is_finite()) {
            diags.push(Diagnostic::validation(format!("{loc}.resources.cpu"), "cpu must be positive"));
        }
    }
    if let Some(mem) = &resources.mem {
        if !is_memory_quantity(mem) {
            diags.push(Diagnostic::validation(
                format!("{loc}.resources.mem"),
                format!("'{mem}' is not a memory size like 512Mi or 2G"),
            ));
        }
    }

    if let Some(timeout) = step.timeout {
        if timeout.as_duration().is_zero() {
            diags.push(Diagnostic::validation(format!("{loc}.timeout"), "timeout must be positive"));
        }
    }

    for secret in &step.secrets {
        if !doc.secrets.contains(secret) {
            diags.push(Diagnostic::validation(
                format!("{loc}.secrets"),
                format!("secret '{secret}' is not declared in the document's secrets list"),
            ));
        }
    }

    if uses == Some(AdapterKind::Human) && step.foreach.is_some() {
        diags.push(Diagnostic::validation(&loc, "human gates cannot use foreach"));
    }

    let after = diags.iter().filter(|d| d.is_error()).count();
    if after > before {
        return None;
    }
    Some(ValidatedStep {
        raw: step.clone(),
        uses: uses?,
        inputs,
        outputs,
        cache,
        retry,
        if_error,
        resources,
    })
}

fn validate_inputs(
    step: &RawStep,
    loc: &str,
    diags: &mut Vec<Diagnostic>,
) -> BTreeMap<String, ValidatedInput> {
    let mut out = BTreeMap::new();
    for (name, raw) in &step.inputs {
        let spec = raw.spec();
        let loc = format!("{loc}.inputs.{name}");
        let type_tag = match spec.type_tag.as_deref() {
            None => TypeTag::Json,
            Some(tag) => match TypeTag::parse(tag) {
                Some(t) => t,
                None => {
                    diags.push(Diagnostic::validation(
                        &loc,
                        format!("unknown type '{tag}' (expected one of {})", type_list()),
                    ));
                    continue;
                }
            },
        };

        let from = match (&spec.from, &spec.value) {
            (Some(_), Some(_)) => {
                diags.push(Diagnostic::validation(&loc, "set either 'from' or 'value', not both"));
                continue;
            }
            (None, None) => {
                diags.push(Diagnostic::validation(&loc, "input needs 'from' or 'value'"));
                continue;
            }
            (Some(source), None) => match parse_reference(source) {
                Ok(r) if matches!(r.scope, Scope::Params | Scope::Vars | Scope::Outputs) => Some(r),
                Ok(r) => {
                    diags.push(Diagnostic::validation(
                        &loc,
                        format!("'{r}': inputs may only come from params, vars or outputs"),
                    ));
                    continue;
                }
                Err(e) => {
                    diags.push(Diagnostic::validation(&loc, format!("bad source '{source}': {e}")));
                    continue;
                }
            },
            (None, Some(_)) => None,
        };

        if let Some(value) = &spec.value {
            let templated = value.as_str().is_some_and(has_template);
            if !templated && !type_tag.check(value) {
                diags.push(Diagnostic::validation(
                    &loc,
                    format!("value {value} is not a valid {type_tag}"),
                ));
            }
        }

        out.insert(
            name.clone(),
            ValidatedInput {
                from,
                value: spec.value.clone(),
                type_tag,
                required: spec.required.unwrap_or(true),
            },
        );
    }
    out
}

fn validate_outputs(step: &RawStep, loc: &str, diags: &mut Vec<Diagnostic>) -> BTreeMap<String, OutputSpec> {
    let mut out = BTreeMap::new();
    for (name, spec) in step.outputs.entries() {
        let loc = format!("{loc}.outputs.{name}");
        // `x: required` / `x: optional` are shorthands for an untyped output.
        let (tag, required) = match spec.type_tag.as_deref() {
            Some("required") => (None, Some(true)),
            Some("optional") => (None, Some(false)),
            other => (other, spec.required),
        };
        let type_tag = match tag {
            None => TypeTag::Json,
            Some(tag) => match TypeTag::parse(tag) {
                Some(t) => t,
                None => {
                    diags.push(Diagnostic::validation(
                        &loc,
                        format!("unknown type '{tag}' (expected one of {})", type_list()),
                    ));
                    continue;
                }
            },
        };
        if let Some(path) = &spec.path {
            if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
                diags.push(Diagnostic::validation(
                    &loc,
                    format!("path '{path}' must be relative to the run directory"),
                ));
            }
        }
        out.insert(
            name,
            OutputSpec {
                type_tag,
                required: required.unwrap_or(true),
                path: spec.path.clone(),
            },
        );
    }
    out
}

fn validate_cache(
    step: &RawStep,
    uses: Option<AdapterKind>,
    loc: &str,
    diags: &mut Vec<Diagnostic>,
) -> CacheSettings {
    let spec = step.cache.as_ref().map(|c| c.spec()).unwrap_or_default();
    let is_human = uses == Some(AdapterKind::Human);
    let policy = match spec.policy.as_deref() {
        None if is_human => CachePolicy::Never,
        None => CachePolicy::Auto,
        Some(raw) => match CachePolicy::parse(raw) {
            Some(CachePolicy::Never) => CachePolicy::Never,
            Some(policy) if is_human => {
                diags.push(Diagnostic::validation(
                    format!("{loc}.cache"),
                    format!(
                        "human gates are never cached; cache policy '{}' is not allowed",
                        policy.as_str()
                    ),
                ));
                CachePolicy::Never
            }
            Some(policy) => policy,
            None => {
                diags.push(Diagnostic::validation(
                    format!("{loc}.cache"),
                    format!("unknown cache policy '{raw}' (expected auto, never, read-only or write-only)"),
                ));
                CachePolicy::Auto
            }
        },
    };
    CacheSettings {
        policy,
        key: spec.key,
        strict: spec.strict,
    }
}

fn validate_retry(step: &RawStep, loc: &str, diags: &mut Vec<Diagnostic>) -> RetryPolicy {
    let defaults = RetryPolicy::default();
    let Some(raw) = &step.retry else {
        return defaults;
    };
    let backoff = raw.backoff.unwrap_or(defaults.backoff);
    if !(backoff.is_finite() && backoff >= 1.0) {
        diags.push(Diagnostic::validation(
            format!("{loc}.retry.backoff"),
            "backoff must be a number >= 1.0",
        ));
    }
    if let (Some(delay), Some(max_delay)) = (raw.delay, raw.max_delay) {
        if max_delay.as_duration() < delay.as_duration() {
            diags.push(Diagnostic::validation(
                format!("{loc}.retry.max_delay"),
                "max_delay is shorter than delay",
            ));
        }
    }
    RetryPolicy {
        max: raw.max.unwrap_or(defaults.max),
        backoff,
        delay: raw.delay,
        max_delay: raw.max_delay,
        jitter: raw.jitter.unwrap_or(defaults.jitter),
    }
}

/// `512Mi`, `2G`, `1Ti`: digits, a K/M/G/T unit, optional `i`.
fn is_memory_quantity(s: &str) -> bool {
    let digits = s.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return false;
    }
    matches!(&s[digits..], "K" | "M" | "G" | "T" | "Ki" | "Mi" | "Gi" | "Ti")
}

fn type_list() -> String {
    TypeTag::ALL.iter().map(TypeTag::as_str).collect::<Vec<_>>().join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> RawDocument {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn messages(diags: &[Diagnostic]) -> Vec<String> {
        diags.iter().filter(|d| d.is_error()).map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_valid_document() {
        let d = doc(r#"
name: demo
params:
  target: {type: string, default: linux}
steps:
  - id: build
    uses: shell
    with: {run: "make"}
    outputs: {artifact: {type: file, path: "out/a.tar"}}
  - id: test
    uses: shell
    needs: [build]
    with: {run: "make test"}
    inputs: {art: "outputs.build.artifact"}
"#);
        let v = validate(&d).unwrap();
        assert_eq!(v.steps.len(), 2);
        assert_eq!(v.steps[0].cache.policy, CachePolicy::Auto);
        assert_eq!(v.steps[0].outputs["artifact"].type_tag, TypeTag::File);
        assert!(v.steps[1].inputs["art"].required);
    }

    #[test]
    fn test_reports_every_problem_at_once() {
        let d = doc(r#"
name: demo
params:
  n: {type: integer}
steps:
  - id: a
    uses: python
  - id: a
    uses: shell
    needs: [ghost]
    with: {run: "x", colour: red}
    cache: sometimes
    outputs: {o: blob}
"#);
        let errs = messages(&validate(&d).unwrap_err());
        let joined = errs.join("\n");
        assert!(joined.contains("params.n: unknown type 'integer'"));
        assert!(joined.contains("unknown adapter 'python'"));
        assert!(joined.contains("duplicate step id 'a'"));
        assert!(joined.contains("unknown step 'ghost'"));
        assert!(joined.contains("'colour' is not a shell setting"));
        assert!(joined.contains("unknown cache policy 'sometimes'"));
        assert!(joined.contains("unknown type 'blob'"));
    }

    #[test]
    fn test_human_gate_cache_rules() {
        let d = doc(r#"
name: gates
steps:
  - {id: ok, uses: human}
  - {id: bad, uses: human, cache: auto}
  - {id: also-bad, uses: human, cache: {policy: read-only}}
  - {id: explicit-never, uses: human, cache: never}
"#);
        let errs = messages(&validate(&d).unwrap_err());
        assert_eq!(errs.len(), 2);
        assert!(errs[0].contains("human gates are never cached"));

        let d = doc("name: g\nsteps:\n  - {id: ok, uses: human}\n");
        let v = validate(&d).unwrap();
        assert_eq!(v.steps[0].cache.policy, CachePolicy::Never);
    }

    #[test]
    fn test_required_fields_and_inputs() {
        let d = doc(r#"
name: demo
steps:
  - id: call
    uses: http
    inputs:
      both: {from: params.x, value: 1}
      neither: {type: int}
      bad-scope: "env.HOME"
      typed: {value: "three", type: int}
"#);
        let joined = messages(&validate(&d).unwrap_err()).join("\n");
        assert!(joined.contains("http steps require 'url'"));
        assert!(joined.contains("set either 'from' or 'value'"));
        assert!(joined.contains("input needs 'from' or 'value'"));
        assert!(joined.contains("inputs may only come from params, vars or outputs"));
        assert!(joined.contains("is not a valid int"));
    }

    #[test]
    fn test_output_shorthands() {
        let d = doc(r#"
name: demo
steps:
  - id: s
    uses: shell
    with: {run: "echo"}
    outputs: {x: required, y: optional, z: int}
"#);
        let v = validate(&d).unwrap();
        let outs = &v.steps[0].outputs;
        assert!(outs["x"].required);
        assert!(!outs["y"].required);
        assert_eq!(outs["z"].type_tag, TypeTag::Int);
    }

    #[test]
    fn test_resources_and_secrets() {
        let d = doc(r#"
name: demo
secrets: [TOKEN]
steps:
  - id: s
    uses: shell
    with: {run: "echo"}
    resources: {cpu: 0, mem: 2GB}
    secrets: [TOKEN, OTHER]
    retry: {backoff: 0.5}
"#);
        let joined = messages(&validate(&d).unwrap_err()).join("\n");
        assert!(joined.contains("cpu must be positive"));
        assert!(joined.contains("'2GB' is not a memory size"));
        assert!(joined.contains("secret 'OTHER' is not declared"));
        assert!(joined.contains("backoff must be a number >= 1.0"));
    }

    #[test]
    fn test_memory_quantity() {
        assert!(is_memory_quantity("512Mi"));
        assert!(is_memory_quantity("2G"));
        assert!(!is_memory_quantity("G"));
        assert!(!is_memory_quantity("2 G"));
        assert!(!is_memory_quantity("2Gb"));
    }
}
