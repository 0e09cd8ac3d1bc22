//! Macro expansion.
//!
//! A `call:` step is replaced by clones of the macro's steps:
//! - ids are scoped to the call site (`{call_id}.{inner_id}`);
//! - `needs` between macro steps are rewritten to the scoped ids, and entry
//!   steps (no local needs) inherit the call's own `needs`;
//! - steps that needed the call id now need the macro's exit steps;
//! - arguments are type-checked and bound as render locals, and local step
//!   ids stay reachable from templates through an alias table.
//!
//! Nothing is substituted textually, so argument values are never parsed as
//! templates.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petal_types::document::{RawMacro, RawStep};
use petal_types::value_type::TypeTag;
use serde_json::Value;

use crate::compiler::compose::implicit_id;
use crate::context::LayeredContext;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::template::{Template, render_tree, templated_strings};

/// Nested macro calls deeper than this are rejected.
const MAX_MACRO_DEPTH: usize = 8;

/// Static scope macro arguments are rendered against.
pub struct MacroScope<'a> {
    pub params: &'a BTreeMap<String, Value>,
    pub vars: &'a BTreeMap<String, Value>,
    pub env: &'a BTreeMap<String, String>,
}

struct Expander<'a> {
    macros: &'a BTreeMap<String, RawMacro>,
    scope: &'a MacroScope<'a>,
    /// Call id -> exit step ids.
    exits: BTreeMap<String, Vec<String>>,
    out: Vec<RawStep>,
    diags: &'a mut Vec<Diagnostic>,
}

/// Expand every macro call in `steps`.
pub fn expand_macros(
    steps: Vec<RawStep>,
    macros: &BTreeMap<String, RawMacro>,
    scope: &MacroScope<'_>,
    diags: &mut Vec<Diagnostic>,
) -> Vec<RawStep> {
    let mut expander = Expander {
        macros,
        scope,
        exits: BTreeMap::new(),
        out: Vec::new(),
        diags,
    };
    for step in steps {
        expander.expand(step, 0);
    }

    let Expander { exits, mut out, .. } = expander;
    if !exits.is_empty() {
        for step in &mut out {
            let mut needs = Vec::new();
            for need in &step.needs {
                match exits.get(need) {
                    Some(targets) => needs.extend(targets.iter().cloned()),
                    None => needs.push(need.clone()),
                }
            }
            dedupe(&mut needs);
            step.needs = needs;
        }
    }
    out
}

impl Expander<'_> {
    fn expand(&mut self, step: RawStep, depth: usize) {
        let Some(name) = step.call.clone() else {
            self.out.push(step);
            return;
        };
        let call_id = step.id().to_string();
        let loc = format!("steps.{call_id}");

        if depth >= MAX_MACRO_DEPTH {
            self.diags.push(Diagnostic::error(
                DiagnosticKind::MacroArgument,
                &loc,
                format!("macro nesting deeper than {MAX_MACRO_DEPTH} (recursive macro '{name}'?)"),
            ));
            return;
        }
        let Some(mac) = self.macros.get(&name) else {
            let known: Vec<&str> = self.macros.keys().map(String::as_str).collect();
            self.diags.push(Diagnostic::validation(
                &loc,
                format!("unknown macro '{name}' (defined: {})", known.join(", ")),
            ));
            return;
        };
        if let Some(field) = unsupported_call_field(&step) {
            self.diags.push(Diagnostic::validation(
                &loc,
                format!("'{field}' cannot be set on a macro call (only id, needs and with)"),
            ));
            return;
        }
        let Some(args) = self.bind_args(&name, mac, &step, &loc) else {
            return;
        };

        let mut body = mac.steps.clone();
        assign_implicit_ids(&mut body);
        let local_ids: BTreeSet<String> = body.iter().map(|s| s.id().to_string()).collect();
        let scoped = |local: &str| format!("{call_id}.{local}");
        let aliases: BTreeMap<String, String> =
            local_ids.iter().map(|l| (l.clone(), scoped(l))).collect();
        let needed_locally: BTreeSet<&str> = body
            .iter()
            .flat_map(|s| s.needs.iter())
            .filter(|n| local_ids.contains(*n))
            .map(String::as_str)
            .collect();
        let exit_ids: Vec<String> = body
            .iter()
            .map(RawStep::id)
            .filter(|id| !needed_locally.contains(id))
            .map(scoped)
            .collect();

        let expanded: Vec<RawStep> = body
            .iter()
            .map(|inner| {
                let mut inner = inner.clone();
                let is_entry = !inner.needs.iter().any(|n| local_ids.contains(n));
                let mut needs: Vec<String> = inner
                    .needs
                    .iter()
                    .map(|n| if local_ids.contains(n) { scoped(n) } else { n.clone() })
                    .collect();
                if is_entry {
                    needs.extend(step.needs.iter().cloned());
                }
                dedupe(&mut needs);
                inner.needs = needs;
                inner.id = Some(scoped(inner.id()));
                inner.bindings = args.clone();
                inner.aliases = aliases.clone();
                inner
            })
            .collect();

        for inner in expanded {
            self.expand(inner, depth + 1);
        }

        let mut flattened = Vec::new();
        for id in exit_ids {
            match self.exits.get(&id) {
                Some(nested) => flattened.extend(nested.iter().cloned()),
                None => flattened.push(id),
            }
        }
        self.exits.insert(call_id, flattened);
    }

    /// Render, check and default the call's arguments.
    fn bind_args(
        &mut self,
        name: &str,
        mac: &RawMacro,
        step: &RawStep,
        loc: &str,
    ) -> Option<BTreeMap<String, Value>> {
        let errors_before = self.diags.len();
        let ctx = LayeredContext::new()
            .bindings(&step.bindings)
            .params(self.scope.params)
            .vars(self.scope.vars)
            .env(self.scope.env);

        let mut bound = BTreeMap::new();
        for (arg, raw) in &step.with {
            let Some(param) = mac.params.get(arg) else {
                self.diags.push(Diagnostic::error(
                    DiagnosticKind::MacroArgument,
                    format!("{loc}.with.{arg}"),
                    format!("macro '{name}' has no parameter '{arg}'"),
                ));
                continue;
            };
            let mut value = raw.clone();
            let mut found = Vec::new();
            templated_strings(raw, "", &mut found);
            let runtime = found.iter().any(|(_, src)| {
                Template::parse(src)
                    .map(|t| t.references().iter().any(|r| ctx.is_runtime(r)))
                    .unwrap_or(false)
            });
            if runtime {
                self.diags.push(Diagnostic::error(
                    DiagnosticKind::MacroArgument,
                    format!("{loc}.with.{arg}"),
                    "macro arguments must be known at compile time (no outputs or inputs)",
                ));
                continue;
            }
            if let Err(errors) = render_tree(&mut value, &ctx, &[]) {
                for (_, e) in errors {
                    self.diags.push(Diagnostic::error(
                        DiagnosticKind::UndefinedReference,
                        format!("{loc}.with.{arg}"),
                        e.to_string(),
                    ));
                }
                continue;
            }

            let spec = param.spec();
            if let Some(tag) = TypeTag::parse(&spec.type_tag) {
                if !tag.check(&value) {
                    self.diags.push(Diagnostic::error(
                        DiagnosticKind::MacroArgument,
                        format!("{loc}.with.{arg}"),
                        format!("argument '{arg}' of macro '{name}' expects {tag}, got {value}"),
                    ));
                    continue;
                }
            }
            bound.insert(arg.clone(), value);
        }

        for (param_name, param) in &mac.params {
            if bound.contains_key(param_name) || step.with.contains_key(param_name) {
                continue;
            }
            let spec = param.spec();
            if TypeTag::parse(&spec.type_tag).is_none() {
                self.diags.push(Diagnostic::validation(
                    format!("macros.{name}.params.{param_name}"),
                    format!("unknown type '{}'", spec.type_tag),
                ));
                continue;
            }
            match spec.default {
                Some(default) => {
                    bound.insert(param_name.clone(), default);
                }
                None if spec.required => self.diags.push(Diagnostic::error(
                    DiagnosticKind::MacroArgument,
                    loc,
                    format!("macro '{name}' requires argument '{param_name}'"),
                )),
                None => {
                    bound.insert(param_name.clone(), Value::Null);
                }
            }
        }

        (self.diags.len() == errors_before).then_some(bound)
    }
}

fn unsupported_call_field(step: &RawStep) -> Option<&'static str> {
    [
        ("uses", step.uses.is_some()),
        ("if", step.condition.is_some()),
        ("foreach", step.foreach.is_some()),
        ("inputs", !step.inputs.is_empty()),
        ("outputs", !step.outputs.is_empty()),
        ("secrets", !step.secrets.is_empty()),
        ("cache", step.cache.is_some()),
        ("resources", step.resources.is_some()),
        ("retry", step.retry.is_some()),
        ("timeout", step.timeout.is_some()),
        ("if_error", step.if_error.is_some()),
        ("writes", step.writes.is_some()),
    ]
    .into_iter()
    .find_map(|(field, set)| set.then_some(field))
}

/// Assign `{uses}#{n}` ids to a step list (macro bodies).
pub fn assign_implicit_ids(steps: &mut [RawStep]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for step in steps.iter_mut() {
        let Some(kind) = step.uses.clone().or_else(|| step.call.clone()) else {
            continue;
        };
        let n = counts.entry(kind.clone()).or_insert(0);
        *n += 1;
        if step.id.is_none() {
            step.id = Some(implicit_id(&kind, *n));
        }
    }
}

fn dedupe(items: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    items.retain(|i| seen.insert(i.clone()));
}
