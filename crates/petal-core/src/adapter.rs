//! Adapter port: how the engine hands a step to an execution backend.
//!
//! Adapters use native async fn in traits. [`AdapterDyn`] is the
//! object-safe twin with boxed futures, blanket-implemented for every
//! [`Adapter`], so the registry can hold adapters of different types.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use petal_types::step::{AdapterConfig, AdapterKind, OutputSpec, ResourceHints};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Output name -> value.
pub type Outputs = BTreeMap<String, Value>;

/// A step as an adapter sees it: rendered, typed, validated, secrets
/// substituted.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub id: String,
    pub config: AdapterConfig,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, OutputSpec>,
    pub resources: ResourceHints,
    pub attempt: u32,
}

/// Run-scoped facilities available to an adapter invocation.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Working directory of the run; adapters may write under it.
    pub run_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Cancelled on run cancellation or step timeout.
    pub cancel: CancellationToken,
    pub span: tracing::Span,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    /// The adapter was handed configuration it cannot use. Not retried.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl AdapterError {
    pub fn retryable(&self) -> bool {
        matches!(self, AdapterError::Timeout(_) | AdapterError::Failed(_))
    }
}

pub trait Adapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Version pinned into lock artifacts and cache keys.
    fn version(&self) -> &str;

    fn execute(
        &self,
        step: &ResolvedStep,
        ctx: &AdapterContext,
    ) -> impl Future<Output = Result<Outputs, AdapterError>> + Send;
}

/// Object-safe form of [`Adapter`].
pub trait AdapterDyn: Send + Sync {
    fn kind(&self) -> AdapterKind;

    fn version(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        step: &'a ResolvedStep,
        ctx: &'a AdapterContext,
    ) -> Pin<Box<dyn Future<Output = Result<Outputs, AdapterError>> + Send + 'a>>;
}

impl<T: Adapter> AdapterDyn for T {
    fn kind(&self) -> AdapterKind {
        Adapter::kind(self)
    }

    fn version(&self) -> &str {
        Adapter::version(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        step: &'a ResolvedStep,
        ctx: &'a AdapterContext,
    ) -> Pin<Box<dyn Future<Output = Result<Outputs, AdapterError>> + Send + 'a>> {
        Box::pin(self.execute(step, ctx))
    }
}

/// Adapter kind -> implementation.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<AdapterKind, Arc<dyn AdapterDyn>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one of the same kind.
    pub fn register<A: Adapter + 'static>(&mut self, adapter: A) -> &mut Self {
        self.adapters.insert(Adapter::kind(&adapter), Arc::new(adapter));
        self
    }

    pub fn get(&self, kind: AdapterKind) -> Option<Arc<dyn AdapterDyn>> {
        self.adapters.get(&kind).cloned()
    }

    /// Adapter tag -> version, for compilation.
    pub fn pins(&self) -> BTreeMap<String, String> {
        self.adapters
            .iter()
            .map(|(kind, adapter)| (kind.tag().to_string(), adapter.version().to_string()))
            .collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.adapters.iter().map(|(k, a)| (k.tag(), a.version())))
            .finish()
    }
}
