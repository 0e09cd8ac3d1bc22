//! Canonical step model.
//!
//! A [`CanonicalStep`] is what the compiler hands to the planner and what the
//! lock artifact stores: ids are final, macros and `foreach` are expanded,
//! defaults are merged and every compile-time template is rendered. The only
//! strings still carrying templates are the ones listed in
//! [`CanonicalStep::deferred`], which the engine renders exactly once at
//! dispatch.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::duration::PetalDuration;
use crate::expr::{Expr, Reference};
use crate::value_type::TypeTag;

// ---------------------------------------------------------------------------
// Adapter kinds
// ---------------------------------------------------------------------------

/// The closed set of adapter kinds a step can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Local process via a shell.
    Shell,
    /// Command inside an existing container runtime.
    Container,
    /// Restricted in-process expression interpreter.
    Eval,
    /// HTTP request.
    Http,
    /// OpenAI-compatible chat completion over HTTP.
    Llm,
    /// Manual approval gate. Never dispatched to an adapter.
    Human,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 6] = [
        AdapterKind::Shell,
        AdapterKind::Container,
        AdapterKind::Eval,
        AdapterKind::Http,
        AdapterKind::Llm,
        AdapterKind::Human,
    ];

    /// Registry lookup from the `uses:` tag. Unknown tags return `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "shell" | "process" => Some(AdapterKind::Shell),
            "container" | "docker" => Some(AdapterKind::Container),
            "eval" => Some(AdapterKind::Eval),
            "http" => Some(AdapterKind::Http),
            "llm" => Some(AdapterKind::Llm),
            "human" => Some(AdapterKind::Human),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            AdapterKind::Shell => "shell",
            AdapterKind::Container => "container",
            AdapterKind::Eval => "eval",
            AdapterKind::Http => "http",
            AdapterKind::Llm => "llm",
            AdapterKind::Human => "human",
        }
    }

    /// Output keys the adapter always produces (default `writes`).
    pub fn output_contract(&self) -> &'static [&'static str] {
        match self {
            AdapterKind::Shell | AdapterKind::Container => &["stdout", "stderr", "exit_code"],
            AdapterKind::Eval => &["result"],
            AdapterKind::Http => &["status", "body", "headers"],
            AdapterKind::Llm => &["text", "model", "usage"],
            AdapterKind::Human => &["approved", "comment"],
        }
    }

    /// Config field names accepted under `with:` (and by unprefixed defaults).
    pub fn config_fields(&self) -> &'static [&'static str] {
        match self {
            AdapterKind::Shell => &["run", "shell", "cwd", "env", "capture"],
            AdapterKind::Container => &["image", "run", "env", "workdir", "runtime"],
            AdapterKind::Eval => &["expr", "bindings"],
            AdapterKind::Http => &["method", "url", "headers", "body", "json"],
            AdapterKind::Llm => &[
                "endpoint",
                "model",
                "prompt",
                "system",
                "temperature",
                "max_tokens",
                "api_key",
            ],
            AdapterKind::Human => &["prompt"],
        }
    }

    /// Config fields that must be present.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            AdapterKind::Shell => &["run"],
            AdapterKind::Container => &["image"],
            AdapterKind::Eval => &["expr"],
            AdapterKind::Http => &["url"],
            AdapterKind::Llm => &["model", "prompt"],
            AdapterKind::Human => &[],
        }
    }

    /// Non-deterministic knobs left out of cache keys unless a step is strict.
    pub fn volatile_fields(&self) -> &'static [&'static str] {
        match self {
            AdapterKind::Llm => &["temperature"],
            _ => &[],
        }
    }

    /// Deserialize a rendered `with:` payload into this kind's typed config.
    pub fn parse_config(&self, with: &Value) -> Result<AdapterConfig, serde_json::Error> {
        let with = match with {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        Ok(match self {
            AdapterKind::Shell => AdapterConfig::Shell(serde_json::from_value(with)?),
            AdapterKind::Container => AdapterConfig::Container(serde_json::from_value(with)?),
            AdapterKind::Eval => AdapterConfig::Eval(serde_json::from_value(with)?),
            AdapterKind::Http => AdapterConfig::Http(serde_json::from_value(with)?),
            AdapterKind::Llm => AdapterConfig::Llm(serde_json::from_value(with)?),
            AdapterKind::Human => AdapterConfig::Human(serde_json::from_value(with)?),
        })
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ---------------------------------------------------------------------------
// Typed adapter configuration
// ---------------------------------------------------------------------------

/// Strongly-typed adapter payload, one variant per [`AdapterKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    Shell(ProcessConfig),
    Container(ContainerConfig),
    Eval(EvalConfig),
    Http(HttpConfig),
    Llm(LlmConfig),
    Human(HumanConfig),
}

impl AdapterConfig {
    pub fn kind(&self) -> AdapterKind {
        match self {
            AdapterConfig::Shell(_) => AdapterKind::Shell,
            AdapterConfig::Container(_) => AdapterKind::Container,
            AdapterConfig::Eval(_) => AdapterKind::Eval,
            AdapterConfig::Http(_) => AdapterKind::Http,
            AdapterConfig::Llm(_) => AdapterKind::Llm,
            AdapterConfig::Human(_) => AdapterKind::Human,
        }
    }
}

/// How process stdout is turned into outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    Text,
    /// Parse stdout as a JSON object and merge its keys into the outputs.
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    pub run: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub capture: CaptureMode,
}

fn default_shell() -> String {
    "sh".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Runtime binary (`docker`, `podman`); falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    pub expr: String,
    #[serde(default)]
    pub bindings: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Bearer token, normally `{{ secrets.NAME }}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HumanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Cache read/write policy for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    #[default]
    Auto,
    Never,
    ReadOnly,
    WriteOnly,
}

impl CachePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(CachePolicy::Auto),
            "never" => Some(CachePolicy::Never),
            "read-only" => Some(CachePolicy::ReadOnly),
            "write-only" => Some(CachePolicy::WriteOnly),
            _ => None,
        }
    }

    /// May serve a hit.
    pub fn reads(&self) -> bool {
        matches!(self, CachePolicy::Auto | CachePolicy::ReadOnly)
    }

    /// May store a fresh result.
    pub fn writes(&self) -> bool {
        matches!(self, CachePolicy::Auto | CachePolicy::WriteOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::Auto => "auto",
            CachePolicy::Never => "never",
            CachePolicy::ReadOnly => "read-only",
            CachePolicy::WriteOnly => "write-only",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub policy: CachePolicy,
    /// Extra user-provided key component (rendered).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Keep volatile config fields in the key.
    #[serde(default)]
    pub strict: bool,
}

/// What happens to dependents when a step fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    Fail,
    /// Record the step as skipped and let dependents continue.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max: u32,
    pub backoff: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<PetalDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<PetalDuration>,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: 0,
            backoff: 2.0,
            delay: None,
            max_delay: None,
            jitter: true,
        }
    }
}

/// Scheduling hints passed to adapters (containers map them to runtime flags).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Memory like `512Mi` or `2G`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<bool>,
}

impl ResourceHints {
    pub fn is_empty(&self) -> bool {
        self == &ResourceHints::default()
    }
}

// ---------------------------------------------------------------------------
// Typed I/O
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Reference into `params`, `vars` or `outputs.<need>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Reference>,
    /// Literal value (used when `from` is absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub required: bool,
    /// Materialization path relative to the run directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A compiled `if:` condition. The source is kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub source: String,
    pub ast: Expr,
}

// ---------------------------------------------------------------------------
// CanonicalStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalStep {
    pub id: String,
    pub uses: AdapterKind,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
    /// Rendered adapter payload. Secrets appear as redaction tokens.
    pub config: Value,
    /// JSON pointers into `config` (or `/outputs/<name>/path`, `/cache/key`)
    /// whose templates are rendered at dispatch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<String>,
    /// Locals bound by macro expansion or `foreach`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bindings: BTreeMap<String, Value>,
    /// Macro-local step id -> scoped step id, used when resolving `outputs.*`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    pub cache: CacheSettings,
    #[serde(default, skip_serializing_if = "ResourceHints::is_empty")]
    pub resources: ResourceHints,
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<PetalDuration>,
    pub if_error: ErrorPolicy,
    /// Advisory: references found in templates, inputs and the condition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reads: Vec<String>,
    /// Advisory: output keys this step is expected to write.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<String>,
}

impl CanonicalStep {
    /// Whether this step can end without producing outputs.
    pub fn may_skip(&self) -> bool {
        self.condition.is_some() || self.if_error == ErrorPolicy::Skip
    }

    /// Resolve a (possibly macro-local) step id to its scoped id.
    pub fn resolve_alias<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }
}
