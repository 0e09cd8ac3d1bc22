//! Layered name resolution for templates and conditions.
//!
//! Bare identifiers walk the layers in a fixed order:
//! locals (macro arguments, `item`/`index`, then the step's declared inputs)
//! -> params -> vars -> outputs of steps in `needs` -> env -> declared secrets.
//! Namespaced forms (`params.x`, `outputs.s.k`, ...) go straight to their layer.
//!
//! The same context serves compile time (no inputs or outputs yet) and
//! dispatch time. At compile time [`LayeredContext::is_runtime`] tells the
//! compiler which references must wait for dispatch.

use std::collections::BTreeMap;

use petal_types::expr::{Reference, Scope};
use serde_json::Value;

use crate::expression::{ExpressionError, Resolver, lookup_path};
use crate::secrets::{SecretResolver, secret_token};

/// How `secrets.NAME` resolves.
#[derive(Clone, Copy, Default)]
pub enum SecretMode<'a> {
    /// Redaction token (templates).
    #[default]
    Token,
    /// Existence check against a resolver (conditions).
    Presence(&'a dyn SecretResolver),
}

#[derive(Clone, Copy, Default)]
pub struct LayeredContext<'a> {
    bindings: Option<&'a BTreeMap<String, Value>>,
    inputs: Option<&'a BTreeMap<String, Value>>,
    /// Input names known before their values (compile time).
    input_names: &'a [String],
    params: Option<&'a BTreeMap<String, Value>>,
    vars: Option<&'a BTreeMap<String, Value>>,
    /// Step id -> outputs object, restricted to `needs`.
    outputs: Option<&'a BTreeMap<String, Value>>,
    needs: &'a [String],
    aliases: Option<&'a BTreeMap<String, String>>,
    env: Option<&'a BTreeMap<String, String>>,
    secrets: &'a [String],
    secret_mode: SecretMode<'a>,
}

impl<'a> LayeredContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bindings(mut self, bindings: &'a BTreeMap<String, Value>) -> Self {
        self.bindings = Some(bindings);
        self
    }

    pub fn inputs(mut self, inputs: &'a BTreeMap<String, Value>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn input_names(mut self, names: &'a [String]) -> Self {
        self.input_names = names;
        self
    }

    pub fn params(mut self, params: &'a BTreeMap<String, Value>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn vars(mut self, vars: &'a BTreeMap<String, Value>) -> Self {
        self.vars = Some(vars);
        self
    }

    pub fn outputs(mut self, outputs: &'a BTreeMap<String, Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn needs(mut self, needs: &'a [String]) -> Self {
        self.needs = needs;
        self
    }

    pub fn aliases(mut self, aliases: &'a BTreeMap<String, String>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    pub fn env(mut self, env: &'a BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn secrets(mut self, secrets: &'a [String]) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn secret_mode(mut self, mode: SecretMode<'a>) -> Self {
        self.secret_mode = mode;
        self
    }

    fn scoped_id<'s>(&'s self, id: &'s str) -> &'s str {
        self.aliases
            .and_then(|a| a.get(id))
            .map(String::as_str)
            .unwrap_or(id)
    }

    fn is_need(&self, id: &str) -> bool {
        let id = self.scoped_id(id);
        self.needs.iter().any(|n| n == id)
    }

    fn is_input(&self, name: &str) -> bool {
        self.input_names.iter().any(|n| n == name)
            || self.inputs.is_some_and(|i| i.contains_key(name))
    }

    /// Whether a reference can only be resolved at dispatch time.
    pub fn is_runtime(&self, reference: &Reference) -> bool {
        match reference.scope {
            Scope::Outputs | Scope::Inputs => true,
            Scope::Local => {
                let Some(head) = reference.head() else {
                    return false;
                };
                if self.bindings.is_some_and(|b| b.contains_key(head)) {
                    return false;
                }
                if self.is_input(head) {
                    return true;
                }
                if self.params.is_some_and(|p| p.contains_key(head))
                    || self.vars.is_some_and(|v| v.contains_key(head))
                {
                    return false;
                }
                self.is_need(head)
            }
            _ => false,
        }
    }

    fn undefined(reference: &Reference) -> ExpressionError {
        ExpressionError::UndefinedReference(reference.to_string())
    }

    fn from_map(
        map: Option<&BTreeMap<String, Value>>,
        reference: &Reference,
    ) -> Result<Value, ExpressionError> {
        let (head, rest) = reference
            .path
            .split_first()
            .ok_or_else(|| Self::undefined(reference))?;
        map.and_then(|m| m.get(head))
            .and_then(|v| lookup_path(v, rest))
            .cloned()
            .ok_or_else(|| Self::undefined(reference))
    }

    fn from_outputs(&self, reference: &Reference) -> Result<Value, ExpressionError> {
        let (head, rest) = reference
            .path
            .split_first()
            .ok_or_else(|| Self::undefined(reference))?;
        let id = self.scoped_id(head);
        match self.outputs.and_then(|o| o.get(id)) {
            // Skipped producer: every key reads as null.
            Some(Value::Null) => Ok(Value::Null),
            Some(outputs) => lookup_path(outputs, rest)
                .cloned()
                .ok_or_else(|| Self::undefined(reference)),
            None => Err(Self::undefined(reference)),
        }
    }

    fn from_env(&self, reference: &Reference) -> Result<Value, ExpressionError> {
        match reference.path.as_slice() {
            [name] => self
                .env
                .and_then(|e| e.get(name))
                .map(|v| Value::String(v.clone()))
                .ok_or_else(|| Self::undefined(reference)),
            _ => Err(Self::undefined(reference)),
        }
    }

    fn from_secrets(&self, reference: &Reference) -> Result<Value, ExpressionError> {
        let [name] = reference.path.as_slice() else {
            return Err(Self::undefined(reference));
        };
        match self.secret_mode {
            SecretMode::Presence(resolver) => Ok(Value::Bool(resolver.exists(name))),
            SecretMode::Token if self.secrets.contains(name) => Ok(Value::String(secret_token(name))),
            SecretMode::Token => Err(ExpressionError::ScopeNotAllowed(format!(
                "secret '{name}' is not declared by this step"
            ))),
        }
    }

    fn bare(&self, reference: &Reference) -> Result<Value, ExpressionError> {
        let Some(head) = reference.head() else {
            return Err(Self::undefined(reference));
        };
        if self.bindings.is_some_and(|b| b.contains_key(head)) {
            return Self::from_map(self.bindings, reference);
        }
        if self.inputs.is_some_and(|i| i.contains_key(head)) {
            return Self::from_map(self.inputs, reference);
        }
        if self.params.is_some_and(|p| p.contains_key(head)) {
            return Self::from_map(self.params, reference);
        }
        if self.vars.is_some_and(|v| v.contains_key(head)) {
            return Self::from_map(self.vars, reference);
        }
        if self.is_need(head) {
            return self.from_outputs(reference);
        }
        if self.env.is_some_and(|e| e.contains_key(head)) {
            return self.from_env(reference);
        }
        if self.secrets.iter().any(|s| s == head) {
            return self.from_secrets(reference);
        }
        Err(Self::undefined(reference))
    }
}

impl Resolver for LayeredContext<'_> {
    fn lookup(&self, reference: &Reference) -> Result<Value, ExpressionError> {
        match reference.scope {
            Scope::Params => Self::from_map(self.params, reference),
            Scope::Vars => Self::from_map(self.vars, reference),
            Scope::Inputs => Self::from_map(self.inputs, reference),
            Scope::Outputs => {
                let head = reference.head().unwrap_or_default();
                if !self.is_need(head) {
                    return Err(ExpressionError::ScopeNotAllowed(format!(
                        "{reference}: step '{head}' is not in needs"
                    )));
                }
                self.from_outputs(reference)
            }
            Scope::Env => self.from_env(reference),
            Scope::Secrets => self.from_secrets(reference),
            Scope::Local => self.bare(reference),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecrets;
    use crate::template::render;
    use serde_json::json;

    fn map(v: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_priority_order() {
        let bindings = map(json!({"item": "x"}));
        let inputs = map(json!({"name": "from-input"}));
        let params = map(json!({"name": "from-param", "mode": "fast"}));
        let vars = map(json!({"mode": "from-var", "dir": "out"}));
        let env = BTreeMap::from([("HOME".to_string(), "/home/p".to_string())]);
        let ctx = LayeredContext::new()
            .bindings(&bindings)
            .inputs(&inputs)
            .params(&params)
            .vars(&vars)
            .env(&env);

        assert_eq!(render("{{ name }}", &ctx).unwrap(), "from-input");
        assert_eq!(render("{{ mode }}", &ctx).unwrap(), "fast");
        assert_eq!(render("{{ vars.mode }}/{{ dir }}", &ctx).unwrap(), "from-var/out");
        assert_eq!(render("{{ item }} {{ HOME }}", &ctx).unwrap(), "x /home/p");
    }

    #[test]
    fn test_outputs_only_from_needs() {
        let outputs = map(json!({"fetch": {"path": "/tmp/a"}, "other": {"x": 1}}));
        let needs = vec!["fetch".to_string()];
        let ctx = LayeredContext::new().outputs(&outputs).needs(&needs);

        assert_eq!(render("{{ outputs.fetch.path }}", &ctx).unwrap(), "/tmp/a");
        assert_eq!(render("{{ fetch.path }}", &ctx).unwrap(), "/tmp/a");
        assert!(render("{{ outputs.other.x }}", &ctx).is_err());
    }

    #[test]
    fn test_missing_output_key_is_undefined() {
        let outputs = map(json!({"fetch": {"path": "/tmp/a"}}));
        let needs = vec!["fetch".to_string()];
        let ctx = LayeredContext::new().outputs(&outputs).needs(&needs);

        let err = ctx
            .lookup(&Reference::new(Scope::Outputs, ["fetch", "pth"]))
            .unwrap_err();
        assert_eq!(err, ExpressionError::UndefinedReference("outputs.fetch.pth".into()));
        assert!(render("cp {{ outputs.fetch.pth }} dst", &ctx).is_err());
    }

    #[test]
    fn test_skipped_producer_reads_as_null() {
        let outputs = map(json!({"maybe": null}));
        let needs = vec!["maybe".to_string()];
        let ctx = LayeredContext::new().outputs(&outputs).needs(&needs);

        let value = ctx
            .lookup(&Reference::new(Scope::Outputs, ["maybe", "report"]))
            .unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(render("[{{ outputs.maybe.report }}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn test_aliases_resolve_macro_local_ids() {
        let outputs = map(json!({"deploy.build": {"tag": "v1"}}));
        let needs = vec!["deploy.build".to_string()];
        let aliases = BTreeMap::from([("build".to_string(), "deploy.build".to_string())]);
        let ctx = LayeredContext::new().outputs(&outputs).needs(&needs).aliases(&aliases);
        assert_eq!(render("{{ outputs.build.tag }}", &ctx).unwrap(), "v1");
    }

    #[test]
    fn test_secrets_render_as_tokens() {
        let declared = vec!["TOKEN".to_string()];
        let ctx = LayeredContext::new().secrets(&declared);
        assert_eq!(render("{{ secrets.TOKEN }}", &ctx).unwrap(), "<<secret:TOKEN>>");
        assert_eq!(render("{{ TOKEN }}", &ctx).unwrap(), "<<secret:TOKEN>>");
        assert!(render("{{ secrets.OTHER }}", &ctx).is_err());
    }

    #[test]
    fn test_secret_presence_mode() {
        let secrets = StaticSecrets::new().with("TOKEN", "v");
        let ctx = LayeredContext::new().secret_mode(SecretMode::Presence(&secrets));
        let t = Reference::new(Scope::Secrets, ["TOKEN"]);
        let u = Reference::new(Scope::Secrets, ["NOPE"]);
        assert_eq!(ctx.lookup(&t).unwrap(), json!(true));
        assert_eq!(ctx.lookup(&u).unwrap(), json!(false));
    }

    #[test]
    fn test_is_runtime_classification() {
        let params = map(json!({"target": "x"}));
        let names = vec!["src".to_string()];
        let needs = vec!["fetch".to_string()];
        let ctx = LayeredContext::new().params(&params).input_names(&names).needs(&needs);

        assert!(!ctx.is_runtime(&Reference::new(Scope::Local, ["target"])));
        assert!(ctx.is_runtime(&Reference::new(Scope::Local, ["src"])));
        assert!(ctx.is_runtime(&Reference::new(Scope::Local, ["fetch", "path"])));
        assert!(ctx.is_runtime(&Reference::new(Scope::Outputs, ["fetch", "path"])));
        assert!(!ctx.is_runtime(&Reference::new(Scope::Params, ["target"])));
    }

    #[test]
    fn test_undefined_bare_identifier() {
        let ctx = LayeredContext::new();
        let err = ctx.lookup(&Reference::new(Scope::Local, ["ghost"])).unwrap_err();
        assert_eq!(err, ExpressionError::UndefinedReference("ghost".into()));
    }
}
