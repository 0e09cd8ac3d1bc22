//! Short-form compiler: documents in, lock artifact out.
//!
//! Passes run once each, in a fixed order, and never re-enter an earlier
//! pass:
//!
//! 1. compose (`extends`, overlays, profile)
//! 2. resolve params and vars
//! 3. expand macros, then `foreach`
//! 4. inject defaults
//! 5. validate
//! 6. render templates, compile conditions, check inputs, infer reads/writes
//! 7. plan
//! 8. lock
//!
//! Every phase batches its diagnostics; the first phase with an error stops
//! compilation and reports all of them.

pub mod compose;
pub mod defaults;
pub mod foreach;
pub mod infer;
pub mod macros;
pub mod params;
pub mod render;

use std::collections::{BTreeMap, BTreeSet};

use petal_types::lock::LockFile;
use petal_types::step::AdapterKind;
use serde_json::Value;

use crate::compiler::compose::{DocumentSource, compose};
use crate::compiler::macros::MacroScope;
use crate::compiler::render::RenderScope;
use crate::dag;
use crate::diagnostic::{CompileError, Diagnostic, DiagnosticKind, Diagnostics};
use crate::lock::{LockParts, build_lock};
use crate::schema::validate;

/// Version pinned for gates that never reach an adapter.
pub const BUILTIN_PIN: &str = "builtin";

/// Everything one compilation needs besides the documents themselves.
#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    /// Root document reference, resolved by the [`DocumentSource`].
    pub root: String,
    /// Extra overlays applied after the document's own.
    pub overlays: Vec<String>,
    pub profile: Option<String>,
    /// Invocation overrides; highest precedence.
    pub params: BTreeMap<String, Value>,
    /// Caller environment. Document `env` entries win over it.
    pub env: BTreeMap<String, String>,
    /// Adapter tag -> version of the registered adapter.
    pub pins: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub lock: LockFile,
    pub warnings: Vec<Diagnostic>,
}

pub fn compile(request: &CompileRequest, source: &dyn DocumentSource) -> Result<CompileOutput, CompileError> {
    let composed = compose(source, &request.root, &request.overlays, request.profile.as_deref())?;
    let mut warnings = composed.warnings;
    let mut doc = composed.document;
    tracing::debug!(name = %doc.name, sources = composed.provenance.sources.len(), "composed document");

    let mut env = request.env.clone();
    env.extend(doc.env.clone());

    // Parameters and vars.
    let mut found = Vec::new();
    let params = params::resolve_params(&doc, &composed.profile_params, &request.params, &mut found);
    let vars = params::resolve_vars(&doc.vars, &params, &env, &mut found);
    warnings.extend(finish(found, "parameter resolution")?);

    // Expansion and defaults.
    let mut found = Vec::new();
    let scope = MacroScope {
        params: &params,
        vars: &vars,
        env: &env,
    };
    let steps = macros::expand_macros(std::mem::take(&mut doc.steps), &doc.macros, &scope, &mut found);
    let mut steps = foreach::expand_foreach(steps, &scope, &mut found);
    defaults::apply_defaults(&mut steps, &doc.defaults, &mut found);
    doc.steps = steps;
    let validated = match validate(&doc) {
        Ok(v) => {
            found.extend(v.warnings.iter().cloned());
            Some(v)
        }
        Err(diags) => {
            found.extend(diags);
            None
        }
    };
    warnings.extend(finish(found, "validation")?);
    let Some(validated) = validated else {
        return Err(CompileError::new("validation", Vec::new()));
    };

    // Rendering and checks.
    let mut found = Vec::new();
    let render_scope = RenderScope {
        params: &params,
        vars: &vars,
        env: &env,
    };
    let steps = render::canonicalize(&validated, &render_scope, &mut found);
    warnings.extend(finish(found, "compilation")?);

    // Planning.
    let mut found = Diagnostics::new();
    let pins = pin_adapters(&steps, &request.pins, &mut found);
    let layers = match dag::plan_diagnostics(&steps) {
        Ok(plan) => plan.layers,
        Err(errors) => {
            found.extend(errors);
            Vec::new()
        }
    };
    warnings.extend(found.finish("planning")?);

    let lock = build_lock(LockParts {
        name: doc.name,
        description: doc.description,
        provenance: composed.provenance,
        pins,
        params,
        vars,
        env: doc.env,
        secrets: doc.secrets,
        steps,
        layers,
    });
    tracing::info!(name = %lock.name, spec_hash = %lock.spec_hash, steps = lock.steps.len(), "compiled plan");
    Ok(CompileOutput { lock, warnings })
}

fn finish(found: Vec<Diagnostic>, phase: &'static str) -> Result<Vec<Diagnostic>, CompileError> {
    let mut diags = Diagnostics::new();
    diags.extend(found);
    diags.finish(phase)
}

/// Pins for the adapter kinds the plan actually uses.
fn pin_adapters(
    steps: &[petal_types::step::CanonicalStep],
    available: &BTreeMap<String, String>,
    diags: &mut Diagnostics,
) -> BTreeMap<String, String> {
    let used: BTreeSet<AdapterKind> = steps.iter().map(|s| s.uses).collect();
    let mut pins = BTreeMap::new();
    for kind in used {
        let version = match (kind, available.get(kind.tag())) {
            (_, Some(v)) => v.clone(),
            (AdapterKind::Human, None) => BUILTIN_PIN.to_string(),
            (_, None) => {
                diags.push(Diagnostic::error(
                    DiagnosticKind::Plan,
                    "steps",
                    format!("no adapter registered for '{kind}'"),
                ));
                continue;
            }
        };
        pins.insert(kind.tag().to_string(), version);
    }
    pins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compose::MemorySource;
    use serde_json::json;

    fn request(root: &str) -> CompileRequest {
        CompileRequest {
            root: root.to_string(),
            pins: BTreeMap::from([
                ("shell".to_string(), "1".to_string()),
                ("eval".to_string(), "1".to_string()),
                ("http".to_string(), "1".to_string()),
            ]),
            ..Default::default()
        }
    }

    const APP: &str = r#"
petal: "1"
name: build
params:
  target: {type: string, default: debug}
  jobs: {type: int, default: 2}
vars:
  out: "dist/{{ params.target }}"
macros:
  pair:
    params: {label: string}
    steps:
      - {id: first, uses: shell, with: {run: "echo {{ label }}"}}
      - {id: second, uses: shell, needs: [first], with: {run: "echo {{ outputs.first.stdout }}"}}
steps:
  - {id: fetch, uses: shell, with: {run: "fetch -j {{ params.jobs }}"}}
  - id: build
    uses: shell
    needs: [fetch]
    foreach: [a, b]
    with: {run: "make {{ item }} -o {{ vars.out }}"}
  - {id: wrap, call: pair, needs: [build], with: {label: done}}
  - {id: report, uses: eval, needs: [wrap], with: {expr: "1 + 1"}}
"#;

    // -----------------------------------------------------------------------
    // End to end
    // -----------------------------------------------------------------------

    #[test]
    fn test_compile_expands_and_plans() {
        let source = MemorySource::new().with("app.yaml", APP);
        let out = compile(&request("app.yaml"), &source).unwrap();
        let lock = &out.lock;

        let ids: Vec<&str> = lock.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["fetch", "build[0]", "build[1]", "wrap.first", "wrap.second", "report"]
        );
        assert_eq!(lock.step("build[1]").unwrap().config["run"], "make b -o dist/debug");
        assert_eq!(lock.step("wrap.first").unwrap().needs, vec!["build[0]", "build[1]"]);
        assert_eq!(lock.step("report").unwrap().needs, vec!["wrap.second"]);
        assert_eq!(
            lock.layers,
            vec![
                vec!["fetch"],
                vec!["build[0]", "build[1]"],
                vec!["wrap.first"],
                vec!["wrap.second"],
                vec!["report"],
            ]
        );
        assert_eq!(lock.pins.keys().collect::<Vec<_>>(), vec!["eval", "shell"]);
        assert!(lock.step("wrap.second").unwrap().deferred.contains(&"/config/run".to_string()));
    }

    #[test]
    fn test_spec_hash_is_deterministic_and_param_sensitive() {
        let source = MemorySource::new().with("app.yaml", APP);
        let a = compile(&request("app.yaml"), &source).unwrap().lock;
        let b = compile(&request("app.yaml"), &source).unwrap().lock;
        assert_eq!(a.spec_hash, b.spec_hash);

        let mut req = request("app.yaml");
        req.params.insert("target".to_string(), json!("release"));
        let c = compile(&req, &source).unwrap().lock;
        assert_ne!(a.spec_hash, c.spec_hash);
        assert_ne!(a.cache_formulas["fetch"].namespace, c.cache_formulas["fetch"].namespace);
    }

    // -----------------------------------------------------------------------
    // Phase errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_validation_errors_are_batched() {
        let source = MemorySource::new().with(
            "bad.yaml",
            r#"
name: bad
steps:
  - {id: a, uses: teleport}
  - {id: b, uses: shell, with: {run: x}, cache: sometimes}
  - {id: c, uses: shell, with: {run: x}, timeout: 5s, retry: {backoff: -1}}
"#,
        );
        let err = compile(&request("bad.yaml"), &source).unwrap_err();
        assert_eq!(err.phase, "validation");
        assert!(err.errors().count() >= 3, "{err}");
    }

    #[test]
    fn test_cycle_fails_planning() {
        let source = MemorySource::new().with(
            "cycle.yaml",
            r#"
name: cycle
steps:
  - {id: a, uses: shell, needs: [c], with: {run: x}}
  - {id: b, uses: shell, needs: [a], with: {run: x}}
  - {id: c, uses: shell, needs: [b], with: {run: x}}
"#,
        );
        let err = compile(&request("cycle.yaml"), &source).unwrap_err();
        assert_eq!(err.phase, "planning");
        let message = err.diagnostics[0].message.clone();
        for id in ["a", "b", "c"] {
            assert!(message.contains(id), "{message}");
        }
    }

    #[test]
    fn test_unregistered_adapter_is_a_planning_error() {
        let source = MemorySource::new().with(
            "llm.yaml",
            "name: l\nsteps:\n  - {id: a, uses: llm, with: {model: m, prompt: p}}\n  - {id: g, uses: human}\n",
        );
        let err = compile(&request("llm.yaml"), &source).unwrap_err();
        assert_eq!(err.phase, "planning");
        assert!(err.diagnostics[0].message.contains("'llm'"));
    }

    #[test]
    fn test_missing_required_param() {
        let source = MemorySource::new().with(
            "p.yaml",
            "name: p\nparams: {target: {type: string, required: true}}\nsteps: []\n",
        );
        let err = compile(&request("p.yaml"), &source).unwrap_err();
        assert_eq!(err.phase, "parameter resolution");

        let mut req = request("p.yaml");
        req.params.insert("target".to_string(), json!("x"));
        let lock = compile(&req, &source).unwrap().lock;
        assert_eq!(lock.params["target"], "x");
        assert!(lock.layers.is_empty());
    }
}
