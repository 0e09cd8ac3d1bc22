//! Single-pass rendering into canonical steps.
//!
//! Every templated string is either rendered now against the static scope
//! (params, vars, env, locals, secret tokens) or left verbatim and listed in
//! [`CanonicalStep::deferred`] when it needs `outputs`, step inputs or
//! `now()`. Deferred pointers are relative to the serialized step, so the
//! engine can render them without knowing which field they live in.

use std::collections::{BTreeMap, BTreeSet};

use petal_types::expr::{Expr, Reference, Scope};
use petal_types::step::{CanonicalStep, Condition, InputSpec};
use serde_json::Value;

use crate::compiler::infer::{advise, infer_writes, read_name};
use crate::context::LayeredContext;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::expression::{Dialect, ExpressionError, Resolver, lookup_path, parse};
use crate::schema::{ValidatedDocument, ValidatedStep};
use crate::template::{Template, TemplateError, escape_pointer, templated_strings};

/// The static scope every step renders against.
pub struct RenderScope<'a> {
    pub params: &'a BTreeMap<String, Value>,
    pub vars: &'a BTreeMap<String, Value>,
    pub env: &'a BTreeMap<String, String>,
}

/// Render, check and canonicalize every step of a validated document.
pub fn canonicalize(
    doc: &ValidatedDocument,
    scope: &RenderScope<'_>,
    diags: &mut Vec<Diagnostic>,
) -> Vec<CanonicalStep> {
    let may_skip: BTreeMap<&str, bool> = doc.steps.iter().map(|s| (s.id(), s.may_skip())).collect();
    doc.steps
        .iter()
        .filter_map(|step| {
            StepRenderer::new(step, doc, scope, &may_skip).render(diags)
        })
        .collect()
}

struct StepRenderer<'a> {
    step: &'a ValidatedStep,
    doc: &'a ValidatedDocument,
    scope: &'a RenderScope<'a>,
    may_skip: &'a BTreeMap<&'a str, bool>,
    input_names: Vec<String>,
    loc: String,
    deferred: Vec<String>,
    reads: BTreeSet<String>,
    errors: Vec<Diagnostic>,
}

impl<'a> StepRenderer<'a> {
    fn new(
        step: &'a ValidatedStep,
        doc: &'a ValidatedDocument,
        scope: &'a RenderScope<'a>,
        may_skip: &'a BTreeMap<&'a str, bool>,
    ) -> Self {
        Self {
            step,
            doc,
            scope,
            may_skip,
            input_names: step.inputs.keys().cloned().collect(),
            loc: format!("steps.{}", step.id()),
            deferred: Vec::new(),
            reads: BTreeSet::new(),
            errors: Vec::new(),
        }
    }

    fn ctx(&self) -> LayeredContext<'_> {
        let raw = &self.step.raw;
        LayeredContext::new()
            .bindings(&raw.bindings)
            .input_names(&self.input_names)
            .params(self.scope.params)
            .vars(self.scope.vars)
            .needs(&raw.needs)
            .aliases(&raw.aliases)
            .env(self.scope.env)
            .secrets(&raw.secrets)
    }

    fn scoped<'s>(&'s self, id: &'s str) -> &'s str {
        self.step.raw.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    fn is_need(&self, id: &str) -> bool {
        let id = self.scoped(id);
        self.step.raw.needs.iter().any(|n| n == id)
    }

    fn note_read(&mut self, reference: &Reference) {
        if let Some(name) = read_name(reference, &self.step.raw, self.scope.params, self.scope.vars) {
            self.reads.insert(name);
        }
    }

    fn render(mut self, diags: &mut Vec<Diagnostic>) -> Option<CanonicalStep> {
        let step = self.step;
        let raw = &step.raw;

        let mut config = Value::Object(raw.with.clone());
        let with_loc = format!("{}.with", self.loc);
        self.render_value(&mut config, "/config", &with_loc);

        let mut outputs = self.step.outputs.clone();
        for (name, spec) in &mut outputs {
            if let Some(path) = spec.path.take() {
                let mut value = Value::String(path);
                let pointer = format!("/outputs/{}/path", escape_pointer(name));
                self.render_value(&mut value, &pointer, &format!("{}.outputs.{name}.path", self.loc));
                spec.path = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
        }

        let mut cache = self.step.cache.clone();
        if let Some(key) = cache.key.take() {
            let mut value = Value::String(key);
            self.render_value(&mut value, "/cache/key", &format!("{}.cache.key", self.loc));
            cache.key = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }

        let inputs = self.check_inputs();
        let condition = self.compile_condition();

        let config_deferred = self.deferred.iter().any(|p| p.starts_with("/config"));
        if !config_deferred {
            if let Err(e) = self.step.uses.parse_config(&config) {
                self.errors
                    .push(Diagnostic::validation(&with_loc, format!("invalid {} settings: {e}", self.step.uses)));
            }
        }
        diags.extend(advise(self.step, &config));

        let failed = !self.errors.is_empty();
        diags.append(&mut self.errors);
        if failed {
            return None;
        }

        Some(CanonicalStep {
            id: raw.id().to_string(),
            uses: self.step.uses,
            needs: raw.needs.clone(),
            condition,
            inputs,
            outputs,
            config,
            deferred: self.deferred,
            bindings: raw.bindings.clone(),
            aliases: raw.aliases.clone(),
            secrets: raw.secrets.clone(),
            cache,
            resources: self.step.resources.clone(),
            retry: self.step.retry.clone(),
            timeout: raw.timeout,
            if_error: self.step.if_error,
            reads: self.reads.into_iter().collect(),
            writes: infer_writes(self.step),
        })
    }

    /// Render static templates in `value`; record runtime ones as deferred
    /// under `prefix`.
    fn render_value(&mut self, value: &mut Value, prefix: &str, loc: &str) {
        let mut found = Vec::new();
        templated_strings(value, "", &mut found);
        let found: Vec<(String, String)> = found.into_iter().map(|(p, s)| (p, s.to_string())).collect();

        for (pointer, source) in found {
            let loc = if pointer.is_empty() {
                loc.to_string()
            } else {
                format!("{loc}{}", pointer.replace('/', "."))
            };
            let template = match Template::parse(&source) {
                Ok(t) => t,
                Err(e) => {
                    self.errors.push(template_diagnostic(&loc, &e));
                    continue;
                }
            };
            let references: Vec<Reference> = template.references().into_iter().cloned().collect();
            for r in &references {
                self.note_read(r);
            }

            let ctx = self.ctx();
            let runtime = references.iter().any(|r| ctx.is_runtime(r)) || template.calls().contains(&"now");
            if !runtime {
                match template.render_value(&ctx) {
                    Ok(rendered) => {
                        if let Some(slot) = value.pointer_mut(&pointer) {
                            *slot = rendered;
                        }
                    }
                    Err(e) => self.errors.push(template_diagnostic(&loc, &e)),
                }
                continue;
            }

            // Deferred: check every reference now so typos fail at compile time.
            let mut problems = Vec::new();
            for r in &references {
                match r.scope {
                    Scope::Outputs => {
                        let head = r.head().unwrap_or_default();
                        if !self.is_need(head) {
                            problems.push(Diagnostic::validation(
                                &loc,
                                format!("'{r}' reads step '{head}', which is not in needs"),
                            ));
                        }
                    }
                    Scope::Inputs => {
                        let head = r.head().unwrap_or_default();
                        if !self.input_names.iter().any(|n| n == head) {
                            problems.push(Diagnostic::error(
                                DiagnosticKind::UndefinedReference,
                                &loc,
                                format!("'{r}': no input named '{head}'"),
                            ));
                        }
                    }
                    _ if ctx.is_runtime(r) => {}
                    _ => {
                        if let Err(e) = ctx.lookup(r) {
                            problems.push(expression_diagnostic(&loc, &e));
                        }
                    }
                }
            }
            if problems.is_empty() {
                self.deferred.push(format!("{prefix}{pointer}"));
            }
            self.errors.extend(problems);
        }
    }

    fn check_inputs(&mut self) -> BTreeMap<String, InputSpec> {
        let mut out = BTreeMap::new();
        let inputs: Vec<_> = self.step.inputs.iter().map(|(n, i)| (n.clone(), i.clone())).collect();
        for (name, input) in inputs {
            let loc = format!("{}.inputs.{name}", self.loc);
            let mut spec = InputSpec {
                from: input.from.clone(),
                value: input.value.clone(),
                type_tag: input.type_tag,
                required: input.required,
            };

            if let Some(reference) = &mut spec.from {
                self.note_read(reference);
                match reference.scope {
                    Scope::Outputs => {
                        let head = reference.head().unwrap_or_default().to_string();
                        let producer = self.scoped(&head).to_string();
                        if !self.is_need(&head) {
                            self.errors.push(Diagnostic::validation(
                                &loc,
                                format!("input reads outputs of '{head}', which is not in needs"),
                            ));
                            continue;
                        }
                        if input.required && self.may_skip.get(producer.as_str()).copied().unwrap_or(false) {
                            self.errors.push(Diagnostic::validation(
                                &loc,
                                format!(
                                    "required input comes from '{producer}', which may be skipped; \
                                     mark the input required: false"
                                ),
                            ));
                            continue;
                        }
                        if let Some(first) = reference.path.first_mut() {
                            *first = producer;
                        }
                    }
                    Scope::Params | Scope::Vars => {
                        let map = if reference.scope == Scope::Params {
                            self.scope.params
                        } else {
                            self.scope.vars
                        };
                        let value = reference
                            .path
                            .split_first()
                            .and_then(|(head, rest)| map.get(head).and_then(|v| lookup_path(v, rest)));
                        match value {
                            None => {
                                self.errors.push(Diagnostic::error(
                                    DiagnosticKind::UndefinedReference,
                                    &loc,
                                    format!("undefined reference '{reference}'"),
                                ));
                                continue;
                            }
                            Some(v) if !v.is_null() && !input.type_tag.check(v) => {
                                self.errors.push(Diagnostic::validation(
                                    &loc,
                                    format!("'{reference}' is {v}, not a valid {}", input.type_tag),
                                ));
                                continue;
                            }
                            Some(_) => {}
                        }
                    }
                    // The validator only admits the three scopes above.
                    _ => {}
                }
            }

            if let Some(mut value) = spec.value.take() {
                let deferred_before = self.deferred.len();
                let pointer = format!("/inputs/{}/value", escape_pointer(&name));
                self.render_value(&mut value, &pointer, &loc);
                let is_deferred = self.deferred.len() > deferred_before;
                if !is_deferred && !input.type_tag.check(&value) {
                    self.errors.push(Diagnostic::validation(
                        &loc,
                        format!("value {value} is not a valid {}", input.type_tag),
                    ));
                }
                spec.value = Some(value);
            }
            out.insert(name, spec);
        }
        out
    }

    fn compile_condition(&mut self) -> Option<Condition> {
        let source = self.step.raw.condition.clone()?;
        let loc = format!("{}.if", self.loc);
        let mut ast = match parse(&source, Dialect::Condition) {
            Ok(ast) => ast,
            Err(e) => {
                self.errors.push(expression_diagnostic(&loc, &e));
                return None;
            }
        };

        let references: Vec<Reference> = ast.references().into_iter().cloned().collect();
        for r in &references {
            self.note_read(r);
            if let Some(problem) = self.check_condition_ref(r, &loc) {
                self.errors.push(problem);
            }
        }

        let aliases = &self.step.raw.aliases;
        if !aliases.is_empty() {
            rewrite_outputs(&mut ast, aliases);
        }
        Some(Condition { source, ast })
    }

    fn check_condition_ref(&self, r: &Reference, loc: &str) -> Option<Diagnostic> {
        let head = r.head().unwrap_or_default();
        let undefined = || {
            Diagnostic::error(
                DiagnosticKind::UndefinedReference,
                loc,
                format!("undefined reference '{r}'"),
            )
        };
        match r.scope {
            Scope::Outputs if !self.is_need(head) => Some(Diagnostic::validation(
                loc,
                format!("'{r}' reads step '{head}', which is not in needs"),
            )),
            Scope::Params if !self.scope.params.contains_key(head) => Some(undefined()),
            Scope::Vars if !self.scope.vars.contains_key(head) => Some(undefined()),
            Scope::Secrets if !self.doc.secrets.iter().any(|s| s == head) => Some(Diagnostic::validation(
                loc,
                format!("secret '{head}' is not declared in the document's secrets list"),
            )),
            Scope::Inputs => Some(Diagnostic::validation(
                loc,
                "conditions are evaluated before inputs are resolved and cannot read them",
            )),
            Scope::Local => {
                let known = self.step.raw.bindings.contains_key(head)
                    || self.scope.params.contains_key(head)
                    || self.scope.vars.contains_key(head)
                    || self.is_need(head)
                    || self.scope.env.contains_key(head);
                (!known).then(undefined)
            }
            _ => None,
        }
    }
}

/// Point `outputs.<local>` references at scoped step ids.
fn rewrite_outputs(ast: &mut Expr, aliases: &BTreeMap<String, String>) {
    ast.map_refs(&mut |reference: &mut Reference| {
        if reference.scope != Scope::Outputs {
            return;
        }
        if let Some(first) = reference.path.first_mut() {
            if let Some(scoped) = aliases.get(first.as_str()) {
                *first = scoped.clone();
            }
        }
    });
}

fn expression_diagnostic(loc: &str, e: &ExpressionError) -> Diagnostic {
    let kind = match e {
        ExpressionError::UndefinedReference(_) => DiagnosticKind::UndefinedReference,
        _ => DiagnosticKind::Validation,
    };
    Diagnostic::error(kind, loc, e.to_string())
}

fn template_diagnostic(loc: &str, e: &TemplateError) -> Diagnostic {
    let kind = if e.undefined_reference().is_some() {
        DiagnosticKind::UndefinedReference
    } else {
        DiagnosticKind::Validation
    };
    Diagnostic::error(kind, loc, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate;
    use petal_types::document::RawDocument;
    use petal_types::value_type::TypeTag;
    use serde_json::json;

    struct Fixture {
        params: BTreeMap<String, Value>,
        vars: BTreeMap<String, Value>,
        env: BTreeMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                params: BTreeMap::from([
                    ("target".to_string(), json!("linux")),
                    ("jobs".to_string(), json!(4)),
                ]),
                vars: BTreeMap::from([("out".to_string(), json!("dist"))]),
                env: BTreeMap::from([("HOME".to_string(), "/home/ci".to_string())]),
            }
        }

        fn run(&self, yaml: &str) -> (Vec<CanonicalStep>, Vec<Diagnostic>) {
            let doc: RawDocument = serde_yaml_ng::from_str(yaml).unwrap();
            let validated = validate(&doc).unwrap();
            let scope = RenderScope {
                params: &self.params,
                vars: &self.vars,
                env: &self.env,
            };
            let mut diags = Vec::new();
            let steps = canonicalize(&validated, &scope, &mut diags);
            (steps, diags)
        }
    }

    fn errors(diags: &[Diagnostic]) -> Vec<String> {
        diags.iter().filter(|d| d.is_error()).map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_static_and_deferred_templates() {
        let (steps, diags) = Fixture::new().run(r#"
name: r
secrets: [TOKEN]
steps:
  - id: build
    uses: shell
    with: {run: "make -j{{ jobs }} {{ params.target }} > {{ vars.out }}/log"}
    outputs: {artifact: {type: file, path: "{{ vars.out }}/app.tar"}}
  - id: upload
    uses: http
    needs: [build]
    secrets: [TOKEN]
    with:
      url: "https://x/{{ outputs.build.artifact }}"
      headers: {auth: "Bearer {{ secrets.TOKEN }}", home: "{{ env.HOME }}"}
      json: {jobs: "{{ params.jobs }}", when: "{{ now() }}"}
"#);
        assert!(errors(&diags).is_empty(), "{diags:?}");
        let build = &steps[0];
        assert_eq!(build.config["run"], "make -j4 linux > dist/log");
        assert_eq!(build.outputs["artifact"].path.as_deref(), Some("dist/app.tar"));
        assert!(build.deferred.is_empty());
        assert_eq!(build.reads, vec!["params.jobs", "params.target", "vars.out"]);

        let upload = &steps[1];
        assert_eq!(upload.deferred, vec!["/config/json/when", "/config/url"]);
        assert_eq!(upload.config["url"], "https://x/{{ outputs.build.artifact }}");
        assert_eq!(upload.config["headers"]["auth"], "Bearer <<secret:TOKEN>>");
        assert_eq!(upload.config["headers"]["home"], "/home/ci");
        // Single-block templates keep their JSON type.
        assert_eq!(upload.config["json"]["jobs"], 4);
        assert_eq!(upload.reads, vec!["outputs.build", "params.jobs"]);
        assert_eq!(upload.writes, vec!["body", "headers", "status"]);
    }

    #[test]
    fn test_undefined_and_out_of_scope_references() {
        let (steps, diags) = Fixture::new().run(r#"
name: r
secrets: [TOKEN]
steps:
  - {id: a, uses: shell, with: {run: "echo"}}
  - id: b
    uses: shell
    with: {run: "echo {{ params.ghost }} {{ outputs.a.stdout }} {{ secrets.TOKEN }}"}
  - id: c
    uses: shell
    with: {run: "{{ nothing }}"}
    if: "outputs.a.exit_code == 0 && inputs.x"
"#);
        assert_eq!(steps.len(), 1);
        let errs = errors(&diags);
        assert!(errs.iter().any(|e| e.contains("steps.b.with.run") && e.contains("'outputs.a.stdout' reads step 'a', which is not in needs")));
        assert!(errs.iter().any(|e| e.contains("params.ghost")));
        assert!(errs.iter().any(|e| e.contains("secret 'TOKEN' is not declared by this step")));
        assert!(errs.iter().any(|e| e.contains("steps.c.with.run") && e.contains("nothing")));
        assert!(errs.iter().any(|e| e.contains("steps.c.if") && e.contains("not in needs")));
        assert!(errs.iter().any(|e| e.contains("cannot read them")));
    }

    #[test]
    fn test_input_checks() {
        let (steps, diags) = Fixture::new().run(r#"
name: r
steps:
  - {id: maybe, uses: shell, with: {run: x}, if: "params.jobs > 2", outputs: [report]}
  - {id: solid, uses: shell, with: {run: x}}
  - id: use
    uses: shell
    needs: [maybe, solid]
    with: {run: "cat {{ inputs.log }} {{ jobs_in }}"}
    inputs:
      log: {from: outputs.solid.stdout, type: string}
      report: {from: outputs.maybe.report, required: false}
      jobs_in: {from: params.jobs, type: int}
      level: {value: "{{ params.jobs }}", type: int}
"#);
        assert!(errors(&diags).is_empty(), "{diags:?}");
        let step = &steps[2];
        assert_eq!(step.deferred, vec!["/config/run"]);
        assert_eq!(step.inputs["level"].value, Some(json!(4)));
        assert_eq!(step.inputs["log"].type_tag, TypeTag::String);

        let (_, diags) = Fixture::new().run(r#"
name: r
steps:
  - {id: maybe, uses: shell, with: {run: x}, if_error: skip}
  - id: use
    uses: shell
    needs: [maybe]
    with: {run: x}
    inputs:
      a: outputs.maybe.stdout
      b: outputs.other.stdout
      c: {from: params.target, type: int}
      d: params.missing
"#);
        let errs = errors(&diags);
        assert_eq!(errs.len(), 4, "{errs:?}");
        assert!(errs[0].contains("which may be skipped"));
        assert!(errs[1].contains("'other', which is not in needs"));
        assert!(errs[2].contains("not a valid int"));
        assert!(errs[3].contains("undefined reference 'params.missing'"));
    }

    #[test]
    fn test_macro_aliases_are_rewritten() {
        let mut doc: RawDocument = serde_yaml_ng::from_str(r#"
name: r
steps:
  - {id: m.first, uses: shell, with: {run: x}}
  - id: m.second
    uses: shell
    needs: [m.first]
    if: "outputs.first.exit_code == 0"
    with: {run: "echo {{ outputs.first.stdout }} {{ size }}"}
    inputs: {o: outputs.first.stdout}
"#).unwrap();
        let second = &mut doc.steps[1];
        second.aliases.insert("first".into(), "m.first".into());
        second.aliases.insert("second".into(), "m.second".into());
        second.bindings.insert("size".into(), json!(3));

        let fixture = Fixture::new();
        let validated = validate(&doc).unwrap();
        let scope = RenderScope {
            params: &fixture.params,
            vars: &fixture.vars,
            env: &fixture.env,
        };
        let mut diags = Vec::new();
        let steps = canonicalize(&validated, &scope, &mut diags);
        assert!(errors(&diags).is_empty(), "{diags:?}");
        let step = &steps[1];
        let condition = step.condition.as_ref().unwrap();
        let refs = condition.ast.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].path, vec!["m.first", "exit_code"]);
        assert_eq!(step.inputs["o"].from.as_ref().unwrap().head(), Some("m.first"));
        assert_eq!(step.deferred, vec!["/config/run"]);
        assert_eq!(step.reads, vec!["outputs.m.first"]);
    }

    #[test]
    fn test_typed_config_is_checked() {
        let (_, diags) = Fixture::new().run(r#"
name: r
steps:
  - {id: a, uses: llm, with: {model: m, prompt: p, max_tokens: "{{ params.target }}"}}
"#);
        let errs = errors(&diags);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("invalid llm settings"));
    }
}
