//! Execution engine: layer-by-layer dispatch of a locked plan.
//!
//! Steps of one layer run concurrently on a `JoinSet`, bounded by a
//! semaphore. A layer is fully committed to the [`RunState`] before the next
//! one starts, so a step never starts before all of its `needs` are settled.
//!
//! Failure propagates along `needs` only: dependents of a failed step fail
//! without dispatch, siblings keep running. Human gates stop at
//! `awaiting_approval`; [`Engine::resume`] continues the run with decisions.

pub mod retry;
pub mod state;
mod step;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use petal_types::config::Settings;
use petal_types::lock::LockFile;
use petal_types::run::{
    Approval, Event, EventKind, ManifestStep, RunManifest, RunSnapshot, RunStatus, StepRecord, StepStatus,
};
use petal_types::step::{AdapterKind, CanonicalStep};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{AdapterError, AdapterRegistry};
use crate::cache::{CacheStore, cache_key, params_namespace};
use crate::context::LayeredContext;
use crate::event::EventBus;
use crate::expression::Resolver;
use crate::hashing::{digest_value, sha256_hex};
use crate::secrets::{SecretError, SecretResolver};
use crate::store::{RunStore, StoreError};

use self::retry::BackoffDefaults;
use self::state::{Readiness, RunState};
use self::step::{Dispatch, StepDetail, run_step};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single step failed. Recorded on the step; never aborts the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("typed input error: {0}")]
    TypedInput(String),

    #[error("typed output error: {0}")]
    TypedOutput(String),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("dependency '{0}' failed")]
    DependencyFailed(String),

    #[error("approval rejected{}", .0.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    Rejected(Option<String>),

    #[error("condition {0}")]
    Condition(String),

    #[error("template error at {0}")]
    Render(String),

    #[error("secret error: {0}")]
    Secret(String),

    #[error("no adapter registered for '{0}'")]
    NoAdapter(AdapterKind),
}

impl From<SecretError> for StepError {
    fn from(e: SecretError) -> Self {
        StepError::Secret(e.to_string())
    }
}

/// Errors that stop the engine itself.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run {run_id} was started from plan {snapshot}, not {lock}")]
    SpecHashMismatch {
        run_id: Uuid,
        snapshot: String,
        lock: String,
    },

    #[error("step '{0}' is not awaiting approval")]
    NotAwaiting(String),

    #[error("lock layers reference unknown step '{0}'")]
    UnknownStep(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub parallelism: usize,
    pub default_timeout: Duration,
    pub backoff: BackoffDefaults,
    /// Environment visible to templates and adapters; the plan's `env` wins.
    pub env: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    /// Fixed run id (fresh runs only).
    pub run_id: Option<Uuid>,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            parallelism: settings.parallelism,
            default_timeout: settings.default_timeout.as_duration(),
            backoff: BackoffDefaults {
                base: settings.retry_base_delay.as_duration(),
                max: settings.retry_max_delay.as_duration(),
            },
            env: BTreeMap::new(),
            cancel: CancellationToken::new(),
            run_id: None,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub snapshot: RunSnapshot,
    pub manifest: RunManifest,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Executes lock artifacts. Generic over the run store.
pub struct Engine<S: RunStore> {
    adapters: AdapterRegistry,
    cache: Arc<dyn CacheStore>,
    secrets: Arc<dyn SecretResolver>,
    store: Arc<S>,
    events: EventBus,
}

impl<S: RunStore + 'static> Engine<S> {
    pub fn new(
        adapters: AdapterRegistry,
        cache: Arc<dyn CacheStore>,
        secrets: Arc<dyn SecretResolver>,
        store: Arc<S>,
        events: EventBus,
    ) -> Self {
        Self {
            adapters,
            cache,
            secrets,
            store,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute a plan from scratch.
    pub async fn run(&self, lock: &LockFile, options: RunOptions) -> Result<RunOutcome, EngineError> {
        let run_id = options.run_id.unwrap_or_else(Uuid::now_v7);
        self.execute(lock, run_id, RunState::new(), options).await
    }

    /// Continue a paused (or failed) run.
    ///
    /// Approved gates succeed with `{approved: true, comment}`; rejected gates
    /// fail and their dependents fail with them. Steps that failed in the
    /// earlier attempt are scheduled again; succeeded and skipped steps keep
    /// their records.
    pub async fn resume(
        &self,
        lock: &LockFile,
        snapshot: RunSnapshot,
        approvals: &[Approval],
        options: RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        if snapshot.spec_hash != lock.spec_hash {
            return Err(EngineError::SpecHashMismatch {
                run_id: snapshot.run_id,
                snapshot: snapshot.spec_hash,
                lock: lock.spec_hash.clone(),
            });
        }
        let run_id = snapshot.run_id;
        let mut state = RunState::from_snapshot(&snapshot);

        let failed: Vec<String> = state
            .records()
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in failed {
            state.clear(&id);
        }

        for approval in approvals {
            let awaiting = state
                .get(&approval.step_id)
                .is_some_and(|r| r.status == StepStatus::AwaitingApproval);
            if !awaiting {
                return Err(EngineError::NotAwaiting(approval.step_id.clone()));
            }
            let now = Utc::now();
            let mut record = if approval.approved {
                let mut r = StepRecord::new(StepStatus::Succeeded);
                r.outputs.insert("approved".to_string(), Value::Bool(true));
                r.outputs.insert(
                    "comment".to_string(),
                    approval.comment.clone().map(Value::String).unwrap_or(Value::Null),
                );
                r
            } else {
                StepRecord::failed(StepError::Rejected(approval.comment.clone()).to_string())
            };
            record.finished_at = Some(now);
            tracing::info!(run_id = %run_id, step_id = %approval.step_id, approved = approval.approved, "approval recorded");
            let mut event = Event::for_step(EventKind::StepFinished, run_id, &approval.step_id).status(record.status);
            if let Some(error) = &record.error {
                event = event.error(error);
            }
            self.emit(event).await;
            state.commit(&approval.step_id, record);
        }

        self.execute(lock, run_id, state, options).await
    }

    /// Describe what a run would do without invoking any adapter.
    ///
    /// Cache keys are included for steps whose inputs and config are fully
    /// known before dispatch.
    pub fn dry_run(&self, lock: &LockFile, env: &BTreeMap<String, String>) -> RunManifest {
        let now = Utc::now();
        let namespace = params_namespace(&lock.params);
        let mut env = env.clone();
        env.extend(lock.env.clone());

        let steps = lock
            .layers
            .iter()
            .flatten()
            .filter_map(|id| lock.step(id))
            .map(|step| {
                let version = lock.pins.get(step.uses.tag()).cloned().unwrap_or_default();
                let key = static_inputs(lock, step, &env).map(|inputs| cache_key(step, &version, &namespace, &inputs));
                ManifestStep {
                    id: step.id.clone(),
                    adapter: step.uses,
                    adapter_version: version,
                    status: StepStatus::Pending,
                    cache_hit: false,
                    attempts: 0,
                    duration_ms: 0,
                    cache_key: key,
                    output_digests: BTreeMap::new(),
                    materialized: BTreeMap::new(),
                    generation: generation(step, &step.config),
                    config: Some(json!({
                        "with": step.config,
                        "deferred": step.deferred,
                        "cache": lock.cache_formulas.get(&step.id),
                    })),
                    error: None,
                }
            })
            .collect();

        RunManifest {
            run_id: Uuid::now_v7(),
            name: lock.name.clone(),
            spec_hash: lock.spec_hash.clone(),
            status: RunStatus::Succeeded,
            started_at: now,
            finished_at: now,
            dry_run: true,
            steps,
        }
    }

    async fn emit(&self, event: Event) {
        self.events.publish(event.clone());
        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(run_id = %event.run_id, error = %e, "failed to record event");
        }
    }

    async fn execute(
        &self,
        lock: &LockFile,
        run_id: Uuid,
        mut state: RunState,
        options: RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let steps: HashMap<&str, &CanonicalStep> = lock.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        if let Some(unknown) = lock.layers.iter().flatten().find(|id| !steps.contains_key(id.as_str())) {
            return Err(EngineError::UnknownStep(unknown.clone()));
        }
        self.check_pins(lock);

        let run_dir = self.store.run_dir(run_id);
        std::fs::create_dir_all(&run_dir).map_err(|e| StoreError::Io {
            path: run_dir.display().to_string(),
            message: e.to_string(),
        })?;

        let mut env = options.env.clone();
        env.extend(lock.env.clone());
        let dispatch = Arc::new(Dispatch {
            run_id,
            lock: Arc::new(lock.clone()),
            env,
            namespace: params_namespace(&lock.params),
            adapters: self.adapters.clone(),
            cache: Arc::clone(&self.cache),
            secrets: Arc::clone(&self.secrets),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            cancel: options.cancel.clone(),
            run_dir,
            default_timeout: options.default_timeout,
            backoff: options.backoff,
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(run_id = %run_id, plan = %lock.name, steps = lock.steps.len(), "starting run");
        self.emit(Event::new(EventKind::RunStarted, run_id)).await;

        let semaphore = Arc::new(Semaphore::new(options.parallelism.max(1)));
        let mut details: BTreeMap<String, StepDetail> = BTreeMap::new();

        for (layer_idx, layer) in lock.layers.iter().enumerate() {
            if options.cancel.is_cancelled() {
                tracing::info!(run_id = %run_id, layer = layer_idx, "run cancelled; not starting further steps");
                break;
            }
            tracing::debug!(run_id = %run_id, layer = layer_idx, steps = layer.len(), "processing layer");

            let mut join_set = JoinSet::new();
            let mut tasks: HashMap<tokio::task::Id, String> = HashMap::new();
            for id in layer {
                if state.is_settled(id) {
                    continue;
                }
                let Some(&step) = steps.get(id.as_str()) else {
                    continue;
                };
                match state.readiness(step) {
                    Readiness::Blocked => {
                        tracing::debug!(step_id = %id, "waiting on an unsettled dependency");
                        continue;
                    }
                    Readiness::DependencyFailed(need) => {
                        let error = StepError::DependencyFailed(need).to_string();
                        tracing::debug!(step_id = %id, error = %error, "not dispatched");
                        self.emit(
                            Event::for_step(EventKind::StepFinished, run_id, id)
                                .status(StepStatus::Failed)
                                .error(&error),
                        )
                        .await;
                        state.commit(id, StepRecord::failed(error));
                        continue;
                    }
                    Readiness::Ready => {}
                }

                let outputs = state.outputs_for(step);
                if step.uses == AdapterKind::Human {
                    let record = self.open_gate(&dispatch, step, &outputs).await;
                    state.commit(id, record);
                    continue;
                }

                let dispatch = Arc::clone(&dispatch);
                let semaphore = Arc::clone(&semaphore);
                let step = step.clone();
                let handle = join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    run_step(dispatch, step, outputs).await
                });
                tasks.insert(handle.id(), id.clone());
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(outcome) => {
                        details.insert(outcome.id.clone(), outcome.detail);
                        state.commit(&outcome.id, outcome.record);
                    }
                    Err(e) => {
                        let Some(id) = tasks.get(&e.id()).cloned() else {
                            continue;
                        };
                        let error = task_failure(e);
                        tracing::error!(run_id = %run_id, step_id = %id, error = %error, "step task aborted");
                        self.emit(
                            Event::for_step(EventKind::StepFinished, run_id, &id)
                                .status(StepStatus::Failed)
                                .error(&error),
                        )
                        .await;
                        state.commit(&id, StepRecord::failed(error));
                    }
                }
            }

            let interim = state.snapshot(run_id, &lock.spec_hash, state.status(false));
            self.store.save_snapshot(&interim).await?;
        }

        let status = state.status(options.cancel.is_cancelled());
        let snapshot = state.snapshot(run_id, &lock.spec_hash, status);
        self.store.save_snapshot(&snapshot).await?;
        let manifest = build_manifest(lock, run_id, status, &state, &details, started_at);
        self.store.save_manifest(&manifest).await?;

        let elapsed = clock.elapsed().as_millis() as u64;
        tracing::info!(run_id = %run_id, status = %status, duration_ms = elapsed, "run finished");
        let mut finished = Event::new(EventKind::RunFinished, run_id).duration_ms(elapsed);
        if status != RunStatus::Succeeded {
            finished = finished.error(format!("run {status}"));
        }
        self.emit(finished).await;

        Ok(RunOutcome {
            run_id,
            status,
            snapshot,
            manifest,
        })
    }

    /// Evaluate a gate's condition and park it for approval.
    async fn open_gate(&self, dispatch: &Dispatch<S>, step: &CanonicalStep, outputs: &BTreeMap<String, Value>) -> StepRecord {
        let run_id = dispatch.run_id;
        match dispatch.condition_holds(step, outputs) {
            Ok(true) => {
                tracing::info!(run_id = %run_id, step_id = %step.id, "awaiting approval");
                self.emit(
                    Event::for_step(EventKind::AwaitingApproval, run_id, &step.id).status(StepStatus::AwaitingApproval),
                )
                .await;
                let mut record = StepRecord::new(StepStatus::AwaitingApproval);
                record.started_at = Some(Utc::now());
                record
            }
            Ok(false) => {
                self.emit(Event::for_step(EventKind::StepSkipped, run_id, &step.id).status(StepStatus::Skipped))
                    .await;
                StepRecord::new(StepStatus::Skipped)
            }
            Err(e) => {
                self.emit(
                    Event::for_step(EventKind::StepFinished, run_id, &step.id)
                        .status(StepStatus::Failed)
                        .error(e.to_string()),
                )
                .await;
                StepRecord::failed(e.to_string())
            }
        }
    }

    /// Warn when a registered adapter differs from the version the plan was
    /// locked against. The pinned version still keys the cache.
    fn check_pins(&self, lock: &LockFile) {
        for (tag, pinned) in &lock.pins {
            let Some(kind) = AdapterKind::from_tag(tag) else {
                continue;
            };
            if let Some(adapter) = self.adapters.get(kind) {
                if adapter.version() != pinned {
                    tracing::warn!(adapter = %tag, pinned = %pinned, registered = adapter.version(), "adapter version differs from lock");
                }
            }
        }
    }
}

/// Message recorded for a step whose task panicked or was aborted.
fn task_failure(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return "step task was cancelled".to_string();
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("step task panicked: {message}")
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

fn build_manifest(
    lock: &LockFile,
    run_id: Uuid,
    status: RunStatus,
    state: &RunState,
    details: &BTreeMap<String, StepDetail>,
    started_at: DateTime<Utc>,
) -> RunManifest {
    let steps = lock
        .layers
        .iter()
        .flatten()
        .filter_map(|id| lock.step(id))
        .map(|step| {
            let record = state.get(&step.id);
            let detail = details.get(&step.id);
            let materialized = detail.map(|d| d.materialized.clone()).unwrap_or_default();
            let output_digests = record
                .map(|r| {
                    r.outputs
                        .iter()
                        .map(|(name, value)| {
                            let digest = materialized
                                .get(name)
                                .and_then(|path| std::fs::read(path).ok())
                                .map(|bytes| sha256_hex(&bytes))
                                .unwrap_or_else(|| digest_value(value));
                            (name.clone(), digest)
                        })
                        .collect()
                })
                .unwrap_or_default();
            let config = detail.and_then(|d| d.config.as_ref()).unwrap_or(&step.config);
            ManifestStep {
                id: step.id.clone(),
                adapter: step.uses,
                adapter_version: lock.pins.get(step.uses.tag()).cloned().unwrap_or_default(),
                status: record.map(|r| r.status).unwrap_or(StepStatus::Pending),
                cache_hit: record.is_some_and(|r| r.cache_hit),
                attempts: record.map(|r| r.attempts).unwrap_or_default(),
                duration_ms: record.map(|r| r.duration_ms).unwrap_or_default(),
                cache_key: record.and_then(|r| r.cache_key.clone()),
                output_digests,
                materialized,
                generation: generation(step, config),
                config: None,
                error: record.and_then(|r| r.error.clone()),
            }
        })
        .collect();

    RunManifest {
        run_id,
        name: lock.name.clone(),
        spec_hash: lock.spec_hash.clone(),
        status,
        started_at,
        finished_at: Utc::now(),
        dry_run: false,
        steps,
    }
}

/// Prompt and sampling parameters of generative steps, as rendered (secret
/// tokens included, never values).
fn generation(step: &CanonicalStep, config: &Value) -> Option<Value> {
    if step.uses != AdapterKind::Llm {
        return None;
    }
    let pick = |field: &str| config.get(field).cloned().unwrap_or(Value::Null);
    Some(json!({
        "endpoint": pick("endpoint"),
        "model": pick("model"),
        "system": pick("system"),
        "prompt": pick("prompt"),
        "temperature": pick("temperature"),
        "max_tokens": pick("max_tokens"),
    }))
}

/// Input values known before dispatch, or `None` when the step depends on
/// runtime values.
fn static_inputs(
    lock: &LockFile,
    step: &CanonicalStep,
    env: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, Value>> {
    if !step.deferred.is_empty() {
        return None;
    }
    let ctx = LayeredContext::new()
        .bindings(&step.bindings)
        .params(&lock.params)
        .vars(&lock.vars)
        .env(env);
    step.inputs
        .iter()
        .map(|(name, spec)| {
            let value = match (&spec.from, &spec.value) {
                (Some(reference), _) => ctx.lookup(reference).ok()?,
                (None, Some(v)) => v.clone(),
                (None, None) => Value::Null,
            };
            Some((name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, AdapterContext, Outputs, ResolvedStep};
    use crate::cache::MemoryCacheStore;
    use crate::compiler::compose::MemorySource;
    use crate::compiler::{CompileRequest, compile};
    use crate::secrets::StaticSecrets;
    use crate::store::MemoryRunStore;
    use dashmap::DashMap;
    use petal_types::step::AdapterConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Barrier;

    /// Shell stand-in driven by the `run` string:
    /// `emit <json>` returns the object, `echo` returns the inputs,
    /// `flaky <n> <json>` fails n times first, `rendezvous` waits for a
    /// sibling on the shared barrier, `hold` tracks peak concurrency, and
    /// `fail`, `sleep` and `panic` do what they say.
    struct Scripted {
        calls: Arc<DashMap<String, u32>>,
        barrier: Arc<Barrier>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Adapter for Scripted {
        fn kind(&self) -> AdapterKind {
            AdapterKind::Shell
        }

        fn version(&self) -> &str {
            "1"
        }

        async fn execute(&self, step: &ResolvedStep, ctx: &AdapterContext) -> Result<Outputs, AdapterError> {
            let calls = {
                let mut entry = self.calls.entry(step.id.clone()).or_default();
                *entry += 1;
                *entry
            };
            let AdapterConfig::Shell(config) = &step.config else {
                return Err(AdapterError::Invalid("not a shell step".into()));
            };
            let emit = |json: &str| -> Result<Outputs, AdapterError> {
                serde_json::from_str(json).map_err(|e| AdapterError::Invalid(e.to_string()))
            };
            let run = config.run.as_str();
            if let Some(json) = run.strip_prefix("emit ") {
                emit(json)
            } else if run.starts_with("echo") {
                Ok(step.inputs.clone())
            } else if let Some(rest) = run.strip_prefix("flaky ") {
                let (n, json) = rest.split_once(' ').unwrap_or((rest, "{}"));
                if calls <= n.parse::<u32>().unwrap_or(0) {
                    Err(AdapterError::Failed(format!("flake {calls}")))
                } else {
                    emit(json)
                }
            } else if run == "rendezvous" {
                tokio::time::timeout(Duration::from_secs(2), self.barrier.wait())
                    .await
                    .map_err(|_| AdapterError::Failed("no sibling arrived".into()))?;
                Ok(Outputs::new())
            } else if run == "hold" {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Outputs::new())
            } else if run == "panic" {
                panic!("adapter blew up");
            } else if run == "sleep" {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(Outputs::new()),
                    _ = ctx.cancel.cancelled() => Err(AdapterError::Cancelled),
                }
            } else {
                Err(AdapterError::Failed(format!("exit status 1: {run}")))
            }
        }
    }

    struct Harness {
        engine: Engine<MemoryRunStore>,
        calls: Arc<DashMap<String, u32>>,
        cache: Arc<MemoryCacheStore>,
        peak: Arc<AtomicUsize>,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_secrets(StaticSecrets::new())
        }

        fn with_secrets(secrets: StaticSecrets) -> Self {
            let dir = TempDir::new().unwrap();
            let calls = Arc::new(DashMap::new());
            let peak = Arc::new(AtomicUsize::new(0));
            let cache = Arc::new(MemoryCacheStore::new());
            let mut adapters = AdapterRegistry::new();
            adapters.register(Scripted {
                calls: Arc::clone(&calls),
                barrier: Arc::new(Barrier::new(2)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::clone(&peak),
            });
            let engine = Engine::new(
                adapters,
                Arc::clone(&cache) as Arc<dyn CacheStore>,
                Arc::new(secrets),
                Arc::new(MemoryRunStore::new(dir.path())),
                EventBus::new(256),
            );
            Self {
                engine,
                calls,
                cache,
                peak,
                _dir: dir,
            }
        }

        fn calls(&self, id: &str) -> u32 {
            self.calls.get(id).map(|c| *c).unwrap_or(0)
        }

        fn events(&self, run_id: Uuid, kind: EventKind) -> Vec<Event> {
            self.engine
                .store()
                .events(run_id)
                .into_iter()
                .filter(|e| e.event_kind == kind)
                .collect()
        }
    }

    fn lock(yaml: &str) -> LockFile {
        let request = CompileRequest {
            root: "w.yaml".to_string(),
            pins: BTreeMap::from([("shell".to_string(), "1".to_string())]),
            ..Default::default()
        };
        compile(&request, &MemorySource::new().with("w.yaml", yaml))
            .unwrap()
            .lock
    }

    fn options() -> RunOptions {
        RunOptions {
            parallelism: 4,
            default_timeout: Duration::from_secs(5),
            backoff: BackoffDefaults {
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    fn status_of(outcome: &RunOutcome, id: &str) -> StepStatus {
        outcome.snapshot.records[id].status
    }

    // -----------------------------------------------------------------------
    // Scheduling and data flow
    // -----------------------------------------------------------------------

    const FAN_OUT: &str = r#"
name: fan
steps:
  - {id: a, uses: shell, with: {run: 'emit {"n": 1}'}, outputs: {n: int}}
  - id: b
    uses: shell
    needs: [a]
    with: {run: echo}
    inputs: {n: {from: outputs.a.n, type: int}}
    outputs: {n: int}
  - id: c
    uses: shell
    needs: [a]
    with: {run: "echo {{ outputs.a.n }}"}
    inputs: {n: {from: outputs.a.n, type: int}}
    outputs: {n: int}
  - {id: d, uses: shell, needs: [b, c], with: {run: 'emit {}'}}
"#;

    #[tokio::test]
    async fn test_fan_out_runs_every_step_once() {
        let h = Harness::new();
        let outcome = h.engine.run(&lock(FAN_OUT), options()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Succeeded);
        for id in ["a", "b", "c", "d"] {
            assert_eq!(status_of(&outcome, id), StepStatus::Succeeded, "{id}");
            assert_eq!(h.calls(id), 1, "{id}");
        }
        assert_eq!(outcome.snapshot.records["b"].outputs["n"], 1);
        assert_eq!(outcome.snapshot.records["c"].outputs["n"], 1);

        let ids: Vec<&str> = outcome.manifest.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert!(outcome.manifest.steps.iter().all(|s| s.adapter_version == "1"));
        assert!(outcome.manifest.steps[0].output_digests.contains_key("n"));

        let events = h.engine.store().events(outcome.run_id);
        assert_eq!(events.first().map(|e| e.event_kind), Some(EventKind::RunStarted));
        assert_eq!(events.last().map(|e| e.event_kind), Some(EventKind::RunFinished));
        assert_eq!(h.events(outcome.run_id, EventKind::StepStarted).len(), 4);
        assert_eq!(h.engine.store().manifest(outcome.run_id), Some(outcome.manifest));
    }

    #[tokio::test]
    async fn test_layer_siblings_run_concurrently() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: together
steps:
  - {id: left, uses: shell, with: {run: rendezvous}, cache: never}
  - {id: right, uses: shell, with: {run: rendezvous}, cache: never}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(status_of(&outcome, "left"), StepStatus::Succeeded);
        assert_eq!(status_of(&outcome, "right"), StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_parallelism_bounds_in_flight_steps() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: serial
steps:
  - {id: a, uses: shell, with: {run: hold}, cache: never}
  - {id: b, uses: shell, with: {run: hold}, cache: never}
  - {id: c, uses: shell, with: {run: hold}, cache: never}
"#,
        );
        let opts = RunOptions {
            parallelism: 1,
            ..options()
        };
        let outcome = h.engine.run(&lock, opts).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(h.calls("a") + h.calls("b") + h.calls("c"), 3);
        assert_eq!(h.peak.load(Ordering::SeqCst), 1);

        let wide = Harness::new();
        wide.engine.run(&lock, options()).await.unwrap();
        assert!(wide.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_panicking_step_fails_alone_and_run_keeps_its_manifest() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: p
steps:
  - {id: a, uses: shell, with: {run: panic}}
  - {id: b, uses: shell, needs: [a], with: {run: 'emit {}'}}
  - {id: c, uses: shell, with: {run: 'emit {}'}}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        let error = outcome.snapshot.records["a"].error.clone().unwrap_or_default();
        assert!(error.contains("adapter blew up"), "{error}");
        assert_eq!(status_of(&outcome, "b"), StepStatus::Failed);
        assert_eq!(h.calls("b"), 0);
        assert_eq!(status_of(&outcome, "c"), StepStatus::Succeeded);
        assert_eq!(h.engine.store().manifest(outcome.run_id), Some(outcome.manifest));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_dependents_only() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: r
steps:
  - {id: a, uses: shell, with: {run: fail}, retry: {max: 2, delay: 1ms, jitter: false}}
  - {id: b, uses: shell, needs: [a], with: {run: 'emit {}'}}
  - {id: c, uses: shell, with: {run: 'emit {}'}}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(h.calls("a"), 3);
        assert_eq!(outcome.snapshot.records["a"].attempts, 3);
        assert_eq!(status_of(&outcome, "b"), StepStatus::Failed);
        assert_eq!(h.calls("b"), 0);
        assert!(
            outcome.snapshot.records["b"]
                .error
                .as_deref()
                .is_some_and(|e| e.contains("dependency 'a' failed"))
        );
        assert_eq!(status_of(&outcome, "c"), StepStatus::Succeeded);
        assert_eq!(h.events(outcome.run_id, EventKind::StepRetrying).len(), 2);
    }

    #[tokio::test]
    async fn test_flaky_step_recovers() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: r
steps:
  - {id: a, uses: shell, with: {run: 'flaky 1 {"ok": true}'}, retry: {max: 3, delay: 1ms}, outputs: {ok: bool}}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.snapshot.records["a"].attempts, 2);
        assert_eq!(outcome.snapshot.records["a"].outputs["ok"], true);
    }

    #[tokio::test]
    async fn test_missing_required_output_fails() {
        let h = Harness::new();
        let lock = lock("name: o\nsteps:\n  - {id: a, uses: shell, with: {run: 'emit {}'}, outputs: {x: int}}\n");
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        let error = outcome.snapshot.records["a"].error.clone().unwrap_or_default();
        assert!(error.contains("required output 'x' was not produced"), "{error}");
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let h = Harness::new();
        let lock = lock("name: t\nsteps:\n  - {id: a, uses: shell, with: {run: sleep}, timeout: 50ms}\n");
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(status_of(&outcome, "a"), StepStatus::Failed);
        let error = outcome.snapshot.records["a"].error.clone().unwrap_or_default();
        assert!(error.contains("timed out"), "{error}");
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let h = Harness::new();
        let opts = options();
        opts.cancel.cancel();
        let outcome = h.engine.run(&lock(FAN_OUT), opts).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(h.calls("a"), 0);
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_second_run_hits_cache() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: c
steps:
  - {id: a, uses: shell, with: {run: 'emit {"n": 7}'}, outputs: {n: int}}
  - {id: fresh, uses: shell, with: {run: 'emit {}'}, cache: never}
"#,
        );
        let first = h.engine.run(&lock, options()).await.unwrap();
        let second = h.engine.run(&lock, options()).await.unwrap();

        assert_eq!(h.calls("a"), 1);
        assert_eq!(h.calls("fresh"), 2);
        let hit = &second.snapshot.records["a"];
        assert!(hit.cache_hit);
        assert_eq!(hit.outputs["n"], 7);
        assert_eq!(hit.cache_key, first.snapshot.records["a"].cache_key);
        assert_eq!(h.events(second.run_id, EventKind::CacheHit).len(), 1);
        assert!(!second.snapshot.records["fresh"].cache_hit);
    }

    #[tokio::test]
    async fn test_secret_typed_input_is_redacted_from_record_and_cache() {
        let h = Harness::with_secrets(StaticSecrets::new().with("TOKEN", "hunter2"));
        let lock = lock(
            r#"
name: leak
secrets: [TOKEN]
steps:
  - id: a
    uses: shell
    with: {run: echo}
    inputs: {tok: {value: TOKEN, type: secret}}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let record = &outcome.snapshot.records["a"];
        assert_eq!(record.outputs["tok"], "<<secret:TOKEN>>");
        let key = record.cache_key.clone().unwrap();
        let cached = h.cache.get(&key).unwrap().unwrap();
        assert_eq!(cached.outputs["tok"], "<<secret:TOKEN>>");

        let persisted = serde_json::to_string(&h.engine.store().events(outcome.run_id)).unwrap();
        assert!(!persisted.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_secret_in_failure_message_is_redacted() {
        let h = Harness::with_secrets(StaticSecrets::new().with("TOKEN", "hunter2"));
        let lock = lock(
            r#"
name: leak
secrets: [TOKEN]
steps:
  - id: a
    uses: shell
    with: {run: 'fail hunter2'}
    inputs: {tok: {value: TOKEN, type: secret}}
    retry: {max: 1, delay: 1ms}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        let error = outcome.snapshot.records["a"].error.clone().unwrap_or_default();
        assert!(error.contains("<<secret:TOKEN>>") && !error.contains("hunter2"), "{error}");
        let retries = h.events(outcome.run_id, EventKind::StepRetrying);
        assert_eq!(retries.len(), 1);
        let persisted = serde_json::to_string(&retries).unwrap();
        assert!(!persisted.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_optional_output_left_out_reads_as_null() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: opt
steps:
  - id: a
    uses: shell
    with: {run: 'emit {"n": 1}'}
    outputs: {n: int, extra: {type: string, required: false}}
  - id: b
    uses: shell
    needs: [a]
    with: {run: echo}
    inputs: {extra: {from: outputs.a.extra, required: false}}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.snapshot.records["a"].outputs["extra"], Value::Null);
        assert_eq!(outcome.snapshot.records["b"].outputs["extra"], Value::Null);
    }

    // -----------------------------------------------------------------------
    // Conditions and error policy
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_false_condition_skips_without_failing_dependents() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: s
steps:
  - {id: a, uses: shell, with: {run: 'emit {"ok": false}'}, outputs: {ok: bool}}
  - {id: b, uses: shell, needs: [a], if: "outputs.a.ok == true", with: {run: 'emit {"x": 1}'}, outputs: {x: int}}
  - id: c
    uses: shell
    needs: [b]
    with: {run: echo}
    inputs: {x: {from: outputs.b.x, type: int, required: false}}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(status_of(&outcome, "b"), StepStatus::Skipped);
        assert_eq!(h.calls("b"), 0);
        assert_eq!(status_of(&outcome, "c"), StepStatus::Succeeded);
        assert_eq!(outcome.snapshot.records["c"].outputs["x"], Value::Null);
        assert_eq!(h.events(outcome.run_id, EventKind::StepSkipped).len(), 1);
    }

    #[tokio::test]
    async fn test_if_error_skip_lets_dependents_run() {
        let h = Harness::new();
        let lock = lock(
            r#"
name: e
steps:
  - {id: a, uses: shell, with: {run: fail}, if_error: skip}
  - {id: b, uses: shell, needs: [a], with: {run: 'emit {}'}}
"#,
        );
        let outcome = h.engine.run(&lock, options()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(status_of(&outcome, "a"), StepStatus::Skipped);
        assert!(outcome.snapshot.records["a"].error.is_some());
        assert_eq!(h.calls("b"), 1);
    }

    // -----------------------------------------------------------------------
    // Approval gates
    // -----------------------------------------------------------------------

    const GATED: &str = r#"
name: g
steps:
  - {id: a, uses: shell, with: {run: 'emit {}'}}
  - {id: gate, uses: human, needs: [a], with: {prompt: "ship it?"}}
  - {id: b, uses: shell, needs: [gate], with: {run: 'emit {}'}}
"#;

    #[tokio::test]
    async fn test_gate_pauses_and_resumes_on_approval() {
        let h = Harness::new();
        let lock = lock(GATED);
        let paused = h.engine.run(&lock, options()).await.unwrap();

        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(status_of(&paused, "gate"), StepStatus::AwaitingApproval);
        assert!(!paused.snapshot.records.contains_key("b"));
        assert_eq!(h.calls("b"), 0);

        let approvals = [Approval {
            step_id: "gate".to_string(),
            approved: true,
            comment: Some("lgtm".to_string()),
        }];
        let resumed = h
            .engine
            .resume(&lock, paused.snapshot.clone(), &approvals, options())
            .await
            .unwrap();
        assert_eq!(resumed.run_id, paused.run_id);
        assert_eq!(resumed.status, RunStatus::Succeeded);
        assert_eq!(resumed.snapshot.records["gate"].outputs["approved"], true);
        assert_eq!(resumed.snapshot.records["gate"].outputs["comment"], "lgtm");
        assert_eq!(h.calls("a"), 1);
        assert_eq!(h.calls("b"), 1);
    }

    #[tokio::test]
    async fn test_rejected_gate_fails_dependents() {
        let h = Harness::new();
        let lock = lock(GATED);
        let paused = h.engine.run(&lock, options()).await.unwrap();
        let approvals = [Approval {
            step_id: "gate".to_string(),
            approved: false,
            comment: None,
        }];
        let resumed = h.engine.resume(&lock, paused.snapshot, &approvals, options()).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Failed);
        assert_eq!(status_of(&resumed, "gate"), StepStatus::Failed);
        assert_eq!(status_of(&resumed, "b"), StepStatus::Failed);
        assert_eq!(h.calls("b"), 0);
    }

    #[tokio::test]
    async fn test_resume_rejects_foreign_snapshots_and_stray_approvals() {
        let h = Harness::new();
        let lock = lock(GATED);
        let paused = h.engine.run(&lock, options()).await.unwrap();

        let stray = [Approval {
            step_id: "a".to_string(),
            approved: true,
            comment: None,
        }];
        let err = h
            .engine
            .resume(&lock, paused.snapshot.clone(), &stray, options())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAwaiting(ref id) if id == "a"));

        let mut other = paused.snapshot;
        other.spec_hash = "0000".to_string();
        let err = h.engine.resume(&lock, other, &[], options()).await.unwrap_err();
        assert!(matches!(err, EngineError::SpecHashMismatch { .. }));
    }

    // -----------------------------------------------------------------------
    // Dry run
    // -----------------------------------------------------------------------

    #[test]
    fn test_dry_run_invokes_nothing() {
        let h = Harness::new();
        let manifest = h.engine.dry_run(&lock(FAN_OUT), &BTreeMap::new());
        assert!(manifest.dry_run);
        assert_eq!(manifest.steps.len(), 4);
        assert!(manifest.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(manifest.steps[0].cache_key.is_some());
        assert!(manifest.steps[1].cache_key.is_none());
        assert!(manifest.steps[2].config.as_ref().is_some_and(|c| c["deferred"][0] == "/config/run"));
        assert_eq!(h.calls.len(), 0);
    }

    #[test]
    fn test_step_error_messages() {
        assert_eq!(StepError::Rejected(None).to_string(), "approval rejected");
        assert_eq!(
            StepError::Rejected(Some("too risky".into())).to_string(),
            "approval rejected: too risky"
        );
        assert_eq!(
            StepError::from(AdapterError::Failed("exit 2".into())).to_string(),
            "adapter error: exit 2"
        );
    }
}
