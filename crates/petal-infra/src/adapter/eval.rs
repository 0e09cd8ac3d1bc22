//! In-process expression adapter (`uses: eval`).
//!
//! Evaluates `expr` with the restricted interpreter dialect. Names resolve
//! against `bindings`, then step inputs (also reachable as `inputs.NAME`).
//! The value is exposed as the `result` output.

use petal_core::adapter::{Adapter, AdapterContext, AdapterError, Outputs, ResolvedStep};
use petal_core::expression::{Dialect, ExpressionError, Resolver, evaluate, lookup_path, parse};
use petal_types::expr::Reference;
use petal_types::step::{AdapterConfig, AdapterKind};
use serde_json::{Map, Value};

use super::ADAPTER_VERSION;

#[derive(Debug, Clone, Default)]
pub struct EvalAdapter;

impl EvalAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Adapter for EvalAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Eval
    }

    fn version(&self) -> &str {
        ADAPTER_VERSION
    }

    async fn execute(&self, step: &ResolvedStep, _ctx: &AdapterContext) -> Result<Outputs, AdapterError> {
        let AdapterConfig::Eval(config) = &step.config else {
            return Err(AdapterError::Invalid(format!("expected eval config, got {}", step.config.kind())));
        };
        let expr = parse(&config.expr, Dialect::Interpreter)
            .map_err(|e| AdapterError::Invalid(format!("expr: {e}")))?;

        let mut root: Map<String, Value> = step.inputs.clone().into_iter().collect();
        root.insert(
            "inputs".to_string(),
            Value::Object(step.inputs.clone().into_iter().collect()),
        );
        root.extend(config.bindings.clone());

        let value = evaluate(&expr, &Bindings(Value::Object(root)))
            .map_err(|e| AdapterError::Failed(e.to_string()))?;
        Ok(Outputs::from([("result".to_string(), value)]))
    }
}

struct Bindings(Value);

impl Resolver for Bindings {
    fn lookup(&self, reference: &Reference) -> Result<Value, ExpressionError> {
        lookup_path(&self.0, &reference.path)
            .cloned()
            .ok_or_else(|| ExpressionError::UndefinedReference(reference.to_string()))
    }
}
