//! Dispatch of a single step.
//!
//! Order for a ready step: condition, deferred templates, inputs, cache key,
//! cache lookup, input checks, secret substitution, attempts (timeout and
//! retry), output materialization and checks, redaction, cache write.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use petal_types::lock::LockFile;
use petal_types::run::{Event, EventKind, StepRecord, StepStatus};
use petal_types::step::{AdapterConfig, CanonicalStep, ErrorPolicy};
use petal_types::value_type::TypeTag;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::StepError;
use super::retry::{BackoffDefaults, next_delay, should_retry};
use crate::adapter::{AdapterContext, AdapterError, AdapterRegistry, Outputs, ResolvedStep};
use crate::cache::{CacheEntry, CacheProvenance, CacheStore, cache_key, input_digest, stable_config};
use crate::context::{LayeredContext, SecretMode};
use crate::expression::{Resolver, evaluate_condition};
use crate::hashing::digest_value;
use crate::secrets::{SecretResolver, redact_output, substitute_secrets};
use crate::store::RunStore;
use crate::template::{Template, escape_pointer};

/// Run-wide state shared by every step task.
pub(crate) struct Dispatch<S> {
    pub run_id: Uuid,
    pub lock: Arc<LockFile>,
    /// Caller environment overlaid with the plan's `env`.
    pub env: BTreeMap<String, String>,
    pub namespace: String,
    pub adapters: AdapterRegistry,
    pub cache: Arc<dyn CacheStore>,
    pub secrets: Arc<dyn SecretResolver>,
    pub store: Arc<S>,
    pub events: super::EventBus,
    pub cancel: CancellationToken,
    pub run_dir: PathBuf,
    pub default_timeout: Duration,
    pub backoff: BackoffDefaults,
}

/// What a step task hands back to the scheduler.
pub(crate) struct StepOutcome {
    pub id: String,
    pub record: StepRecord,
    pub detail: StepDetail,
}

/// Per-step facts for the manifest that do not belong in the run state.
#[derive(Debug, Clone, Default)]
pub(crate) struct StepDetail {
    /// Rendered config, secrets still as tokens.
    pub config: Option<Value>,
    pub materialized: BTreeMap<String, String>,
    /// Secrets whose values reach the adapter: the step's `secrets` plus
    /// the names carried by secret-typed inputs.
    pub revealed: Vec<String>,
}

enum Flow {
    Skipped,
    Hit(Outputs),
    Ran(Outputs),
}

impl<S: RunStore> Dispatch<S> {
    pub async fn emit(&self, event: Event) {
        self.events.publish(event.clone());
        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(run_id = %self.run_id, error = %e, "failed to record event");
        }
    }

    /// Replace revealed secret values in a message with their tokens.
    pub fn redact_message(&self, message: String, revealed: &[String]) -> String {
        let mut value = Value::String(message);
        redact_output(&mut value, revealed, self.secrets.as_ref());
        match value {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }

    pub fn adapter_version(&self, step: &CanonicalStep) -> String {
        self.lock.pins.get(step.uses.tag()).cloned().unwrap_or_default()
    }

    fn context<'a>(&'a self, step: &'a CanonicalStep, outputs: &'a BTreeMap<String, Value>) -> LayeredContext<'a> {
        LayeredContext::new()
            .bindings(&step.bindings)
            .params(&self.lock.params)
            .vars(&self.lock.vars)
            .outputs(outputs)
            .needs(&step.needs)
            .aliases(&step.aliases)
            .env(&self.env)
            .secrets(&step.secrets)
    }

    /// Evaluate `if:`. Steps without a condition always run.
    pub fn condition_holds(&self, step: &CanonicalStep, outputs: &BTreeMap<String, Value>) -> Result<bool, StepError> {
        let Some(condition) = &step.condition else {
            return Ok(true);
        };
        let ctx = self
            .context(step, outputs)
            .secret_mode(SecretMode::Presence(self.secrets.as_ref()));
        evaluate_condition(&condition.ast, &ctx)
            .map_err(|e| StepError::Condition(format!("'{}': {e}", condition.source)))
    }
}

/// Run one ready step to a committed record.
pub(crate) async fn run_step<S: RunStore>(
    dispatch: Arc<Dispatch<S>>,
    step: CanonicalStep,
    outputs: BTreeMap<String, Value>,
) -> StepOutcome {
    let started_at = Utc::now();
    let clock = Instant::now();
    let mut record = StepRecord::new(StepStatus::Running);
    record.started_at = Some(started_at);
    let mut detail = StepDetail {
        revealed: step.secrets.clone(),
        ..StepDetail::default()
    };

    let flow = execute(&dispatch, &step, &outputs, &mut record, &mut detail).await;

    record.finished_at = Some(Utc::now());
    record.duration_ms = clock.elapsed().as_millis() as u64;
    let run_id = dispatch.run_id;
    let finished = |kind| Event::for_step(kind, run_id, &step.id).attempt(record.attempts);

    match flow {
        Ok(Flow::Skipped) => {
            record.status = StepStatus::Skipped;
            tracing::debug!(step_id = %step.id, "condition false; step skipped");
            dispatch.emit(finished(EventKind::StepSkipped).status(StepStatus::Skipped)).await;
        }
        Ok(Flow::Hit(values)) => {
            record.status = StepStatus::Succeeded;
            record.cache_hit = true;
            record.outputs = values;
            tracing::debug!(step_id = %step.id, "cache hit");
            dispatch.emit(finished(EventKind::CacheHit).cache_hit(true)).await;
            dispatch
                .emit(
                    finished(EventKind::StepFinished)
                        .status(StepStatus::Succeeded)
                        .cache_hit(true)
                        .duration_ms(record.duration_ms),
                )
                .await;
        }
        Ok(Flow::Ran(values)) => {
            record.status = StepStatus::Succeeded;
            record.outputs = values;
            tracing::debug!(step_id = %step.id, attempts = record.attempts, "step succeeded");
            dispatch
                .emit(
                    finished(EventKind::StepFinished)
                        .status(StepStatus::Succeeded)
                        .duration_ms(record.duration_ms),
                )
                .await;
        }
        Err(error) => {
            let message = dispatch.redact_message(error.to_string(), &detail.revealed);
            record.error = Some(message.clone());
            if step.if_error == ErrorPolicy::Skip {
                record.status = StepStatus::Skipped;
                tracing::warn!(step_id = %step.id, error = %message, "step failed; skipped by if_error");
                dispatch
                    .emit(finished(EventKind::StepSkipped).status(StepStatus::Skipped).error(&message))
                    .await;
            } else {
                record.status = StepStatus::Failed;
                tracing::debug!(step_id = %step.id, error = %message, "step failed");
                dispatch
                    .emit(
                        finished(EventKind::StepFinished)
                            .status(StepStatus::Failed)
                            .duration_ms(record.duration_ms)
                            .error(&message),
                    )
                    .await;
            }
        }
    }

    StepOutcome {
        id: step.id.clone(),
        record,
        detail,
    }
}

async fn execute<S: RunStore>(
    dispatch: &Dispatch<S>,
    step: &CanonicalStep,
    outputs: &BTreeMap<String, Value>,
    record: &mut StepRecord,
    detail: &mut StepDetail,
) -> Result<Flow, StepError> {
    if !dispatch.condition_holds(step, outputs)? {
        return Ok(Flow::Skipped);
    }

    let (rendered, inputs) = render(dispatch, step, outputs)?;
    detail.config = Some(rendered.config.clone());
    for name in secret_input_names(&rendered, &inputs) {
        if !detail.revealed.contains(&name) {
            detail.revealed.push(name);
        }
    }

    let version = dispatch.adapter_version(&rendered);
    let key = cache_key(&rendered, &version, &dispatch.namespace, &inputs);
    record.cache_key = Some(key.clone());

    if rendered.cache.policy.reads() {
        match dispatch.cache.get(&key) {
            Ok(Some(mut entry)) => {
                fill_optional(&rendered, &mut entry.outputs);
                return Ok(Flow::Hit(entry.outputs));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(step_id = %step.id, error = %e, "ignoring unreadable cache entry"),
        }
    }

    check_inputs(dispatch, &rendered, &inputs)?;
    let typed = rendered
        .uses
        .parse_config(&rendered.config)
        .map_err(|e| AdapterError::Invalid(e.to_string()))?;
    let (config, adapter_inputs) = reveal_secrets(dispatch, &rendered, typed, &inputs)?;

    let mut produced = attempt_loop(dispatch, &rendered, config, adapter_inputs, &detail.revealed, record).await?;
    materialize(&rendered, &mut produced, &dispatch.run_dir, detail)?;
    check_outputs(&rendered, &produced)?;
    fill_optional(&rendered, &mut produced);

    let mut tree = Value::Object(produced.into_iter().collect::<Map<String, Value>>());
    redact_output(&mut tree, &detail.revealed, dispatch.secrets.as_ref());
    let produced: Outputs = match tree {
        Value::Object(map) => map.into_iter().collect(),
        _ => Outputs::new(),
    };

    if rendered.cache.policy.writes() {
        let entry = CacheEntry {
            key: key.clone(),
            outputs: produced.clone(),
            provenance: CacheProvenance {
                step_id: rendered.id.clone(),
                adapter: rendered.uses,
                adapter_version: version,
                config_digest: digest_value(&stable_config(&rendered).0),
                input_digests: rendered
                    .inputs
                    .iter()
                    .map(|(name, spec)| {
                        let value = inputs.get(name).unwrap_or(&Value::Null);
                        (name.clone(), input_digest(spec, value))
                    })
                    .collect(),
            },
            created_at: Utc::now(),
        };
        if let Err(e) = dispatch.cache.put(&entry) {
            tracing::warn!(step_id = %step.id, error = %e, "failed to write cache entry");
        }
    }

    Ok(Flow::Ran(produced))
}

// ---------------------------------------------------------------------------
// Rendering and inputs
// ---------------------------------------------------------------------------

/// Render deferred templates and resolve input values. Input literals render
/// first so the remaining templates can read `inputs.*`.
fn render<S: RunStore>(
    dispatch: &Dispatch<S>,
    step: &CanonicalStep,
    outputs: &BTreeMap<String, Value>,
) -> Result<(CanonicalStep, BTreeMap<String, Value>), StepError> {
    let base = dispatch.context(step, outputs);
    let mut doc = serde_json::to_value(step).map_err(|e| StepError::Render(e.to_string()))?;

    let (input_ptrs, other_ptrs): (Vec<&String>, Vec<&String>) =
        step.deferred.iter().partition(|p| p.starts_with("/inputs/"));
    render_pointers(&mut doc, &input_ptrs, &base)?;

    let mut inputs = BTreeMap::new();
    for (name, spec) in &step.inputs {
        let value = match &spec.from {
            Some(reference) => base
                .lookup(reference)
                .map_err(|e| StepError::Render(format!("/inputs/{name}/from: {e}")))?,
            None => doc
                .pointer(&format!("/inputs/{}/value", escape_pointer(name)))
                .cloned()
                .unwrap_or(Value::Null),
        };
        inputs.insert(name.clone(), value);
    }

    let with_inputs = base.inputs(&inputs);
    render_pointers(&mut doc, &other_ptrs, &with_inputs)?;
    let rendered: CanonicalStep = serde_json::from_value(doc).map_err(|e| StepError::Render(e.to_string()))?;
    Ok((rendered, inputs))
}

fn render_pointers(doc: &mut Value, pointers: &[&String], ctx: &dyn Resolver) -> Result<(), StepError> {
    for pointer in pointers {
        let Some(Value::String(source)) = doc.pointer(pointer) else {
            continue;
        };
        let value = Template::parse(source)
            .and_then(|t| t.render_value(ctx))
            .map_err(|e| StepError::Render(format!("{pointer}: {e}")))?;
        if let Some(slot) = doc.pointer_mut(pointer) {
            *slot = value;
        }
    }
    Ok(())
}

/// Secret names carried by secret-typed inputs.
fn secret_input_names(step: &CanonicalStep, inputs: &BTreeMap<String, Value>) -> Vec<String> {
    step.inputs
        .iter()
        .filter(|(_, spec)| spec.type_tag == TypeTag::Secret)
        .filter_map(|(name, _)| inputs.get(name).and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn check_inputs<S: RunStore>(
    dispatch: &Dispatch<S>,
    step: &CanonicalStep,
    inputs: &BTreeMap<String, Value>,
) -> Result<(), StepError> {
    for (name, spec) in &step.inputs {
        let value = inputs.get(name).unwrap_or(&Value::Null);
        if value.is_null() {
            if spec.required {
                return Err(StepError::TypedInput(format!("required input '{name}' is missing")));
            }
            continue;
        }
        if spec.type_tag == TypeTag::Secret {
            let declared = value
                .as_str()
                .is_some_and(|s| dispatch.lock.secrets.iter().chain(&step.secrets).any(|d| d == s));
            if !declared {
                return Err(StepError::TypedInput(format!(
                    "input '{name}' must name a declared secret"
                )));
            }
        } else if !spec.type_tag.check_on_disk(value) {
            return Err(StepError::TypedInput(describe_mismatch("input", name, spec.type_tag, value)));
        }
    }
    Ok(())
}

/// Build the adapter payload: substitute secret tokens in the config and
/// resolve secret-typed inputs. The result lives only for this dispatch.
fn reveal_secrets<S: RunStore>(
    dispatch: &Dispatch<S>,
    step: &CanonicalStep,
    typed: AdapterConfig,
    inputs: &BTreeMap<String, Value>,
) -> Result<(AdapterConfig, BTreeMap<String, Value>), StepError> {
    let resolver = dispatch.secrets.as_ref();
    let config = if step.secrets.is_empty() {
        typed
    } else {
        let mut payload = step.config.clone();
        substitute_secrets(&mut payload, &step.secrets, resolver)?;
        // Parsed once already with tokens in place; only the values changed.
        step.uses
            .parse_config(&payload)
            .map_err(|_| AdapterError::Invalid("configuration changed shape after secret substitution".into()))?
    };

    let mut revealed = inputs.clone();
    for (name, spec) in &step.inputs {
        if let (TypeTag::Secret, Some(Value::String(secret))) = (spec.type_tag, inputs.get(name)) {
            let value = resolver.resolve(secret)?;
            revealed.insert(name.clone(), Value::String(value.expose_secret().to_string()));
        }
    }
    Ok((config, revealed))
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

async fn attempt_loop<S: RunStore>(
    dispatch: &Dispatch<S>,
    step: &CanonicalStep,
    config: AdapterConfig,
    inputs: BTreeMap<String, Value>,
    revealed: &[String],
    record: &mut StepRecord,
) -> Result<Outputs, StepError> {
    let adapter = dispatch
        .adapters
        .get(step.uses)
        .ok_or(StepError::NoAdapter(step.uses))?;
    let timeout = step
        .timeout
        .map(|t| t.as_duration())
        .unwrap_or(dispatch.default_timeout);

    let mut resolved = ResolvedStep {
        id: step.id.clone(),
        config,
        inputs,
        outputs: step.outputs.clone(),
        resources: step.resources.clone(),
        attempt: 0,
    };
    let mut failures = 0;
    loop {
        let attempt = failures + 1;
        record.attempts = attempt;
        resolved.attempt = attempt;
        dispatch
            .emit(Event::for_step(EventKind::StepStarted, dispatch.run_id, &step.id).attempt(attempt))
            .await;
        tracing::debug!(step_id = %step.id, attempt, "dispatching step");

        let cancel = dispatch.cancel.child_token();
        let ctx = AdapterContext {
            run_id: dispatch.run_id,
            run_dir: dispatch.run_dir.clone(),
            env: dispatch.env.clone(),
            cancel: cancel.clone(),
            span: tracing::info_span!("adapter", step_id = %step.id, attempt),
        };
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, adapter.execute_boxed(&resolved, &ctx)) => match r {
                Ok(r) => r,
                Err(_) => {
                    cancel.cancel();
                    Err(AdapterError::Timeout(timeout))
                }
            },
            _ = dispatch.cancel.cancelled() => {
                cancel.cancel();
                Err(AdapterError::Cancelled)
            }
        };

        let error = match result {
            Ok(outputs) => return Ok(outputs),
            Err(e) => e,
        };
        failures += 1;
        if !(error.retryable() && should_retry(&step.retry, failures)) || dispatch.cancel.is_cancelled() {
            return Err(error.into());
        }

        let delay = next_delay(&step.retry, failures, dispatch.backoff);
        let message = dispatch.redact_message(error.to_string(), revealed);
        tracing::warn!(
            step_id = %step.id,
            attempt,
            error = %message,
            delay_ms = delay.as_millis() as u64,
            "step attempt failed; retrying"
        );
        dispatch
            .emit(
                Event::for_step(EventKind::StepRetrying, dispatch.run_id, &step.id)
                    .attempt(attempt)
                    .status(StepStatus::Retrying)
                    .error(message),
            )
            .await;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = dispatch.cancel.cancelled() => return Err(AdapterError::Cancelled.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Write outputs that declare a `path` under the run directory and replace
/// their values with the absolute file path. An output the adapter did not
/// return counts as produced when the file already exists.
fn materialize(
    step: &CanonicalStep,
    outputs: &mut Outputs,
    run_dir: &Path,
    detail: &mut StepDetail,
) -> Result<(), StepError> {
    for (name, spec) in &step.outputs {
        let Some(rel) = &spec.path else {
            continue;
        };
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() || rel_path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(StepError::TypedOutput(format!(
                "output '{name}' path '{rel}' must stay inside the run directory"
            )));
        }
        let target = run_dir.join(rel_path);
        match outputs.get(name) {
            Some(value) if !value.is_null() => {
                let bytes = match value {
                    Value::String(s) => s.clone().into_bytes(),
                    other => serde_json::to_vec_pretty(other).map_err(|e| StepError::TypedOutput(e.to_string()))?,
                };
                write_file(&target, &bytes)
                    .map_err(|e| StepError::TypedOutput(format!("cannot write output '{name}': {e}")))?;
            }
            _ if target.exists() => {}
            _ => continue,
        }
        let absolute = target.to_string_lossy().into_owned();
        outputs.insert(name.clone(), Value::String(absolute.clone()));
        detail.materialized.insert(name.clone(), absolute);
    }
    Ok(())
}

/// Declared outputs the adapter left out read as null downstream.
fn fill_optional(step: &CanonicalStep, outputs: &mut Outputs) {
    for name in step.outputs.keys() {
        outputs.entry(name.clone()).or_insert(Value::Null);
    }
}

fn write_file(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, bytes)
}

/// Required outputs must be present and every declared output must match
/// its type. Extra keys outside the adapter contract are only logged.
fn check_outputs(step: &CanonicalStep, outputs: &Outputs) -> Result<(), StepError> {
    for (name, spec) in &step.outputs {
        match outputs.get(name) {
            None | Some(Value::Null) if spec.required => {
                return Err(StepError::TypedOutput(format!(
                    "required output '{name}' was not produced"
                )));
            }
            None | Some(Value::Null) => {}
            Some(value) if !spec.type_tag.check_on_disk(value) => {
                return Err(StepError::TypedOutput(describe_mismatch("output", name, spec.type_tag, value)));
            }
            Some(_) => {}
        }
    }
    let contract = step.uses.output_contract();
    for extra in outputs
        .keys()
        .filter(|k| !step.outputs.contains_key(*k) && !contract.contains(&k.as_str()))
    {
        tracing::warn!(step_id = %step.id, output = %extra, "adapter returned an undeclared output");
    }
    Ok(())
}

fn describe_mismatch(what: &str, name: &str, tag: TypeTag, value: &Value) -> String {
    let shown = match value {
        Value::String(s) if matches!(tag, TypeTag::File | TypeTag::Dir) => format!("'{s}' (not a {tag} on disk)"),
        other => {
            let mut text = other.to_string();
            if text.len() > 80 {
                text = format!("{}...", text.chars().take(77).collect::<String>());
            }
            text
        }
    };
    format!("{what} '{name}' expected {tag}, got {shown}")
}
