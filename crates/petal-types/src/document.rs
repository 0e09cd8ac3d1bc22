//! Raw short-form document model.
//!
//! This is the shape authors write. Type tags, policies and adapter names are
//! kept as plain strings here so the validator can report every problem in a
//! single pass instead of failing at the first bad enum value during
//! deserialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::duration::PetalDuration;
use crate::step::ResourceHints;

/// Supported document format version.
pub const FORMAT_VERSION: &str = "1";

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A Petal document after composition (extends/overlays already merged).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDocument {
    /// Format version marker (`petal: "1"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub petal: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Base document this one extends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Ordered partial documents merged over this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlays: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, RawParam>,
    /// Document variables. Values may be templates over params/env/vars.
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Secret names steps of this document may reference.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Dotted-path defaults (`shell.shell: bash`, `timeout: 30s`).
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub macros: BTreeMap<String, RawMacro>,
    #[serde(default)]
    pub profiles: BTreeMap<String, RawProfile>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A parameter declaration: either a bare type tag or a full spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawParam {
    Short(String),
    Full(RawParamSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawParamSpec {
    #[serde(rename = "type", default = "default_type")]
    pub type_tag: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

fn default_type() -> String {
    "string".to_string()
}

impl RawParam {
    /// Normalize the short form into a full spec.
    pub fn spec(&self) -> RawParamSpec {
        match self {
            RawParam::Short(tag) => RawParamSpec {
                type_tag: tag.clone(),
                required: false,
                default: None,
                help: None,
            },
            RawParam::Full(spec) => spec.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A step as authored, before shortcuts are expanded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    /// Macro invocation (mutually exclusive with `uses`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Static fan-out: a list literal or a `params.*` / `vars.*` reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<Value>,
    /// Adapter payload, or macro arguments for `call` steps.
    #[serde(default)]
    pub with: Map<String, Value>,
    #[serde(default)]
    pub inputs: BTreeMap<String, RawInput>,
    #[serde(default)]
    pub outputs: RawOutputs,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<RawCache>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceHints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RawRetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<PetalDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_error: Option<String>,
    /// Explicit override of the adapter's output contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writes: Option<Vec<String>>,
    /// In an overlay: add this step instead of replacing a same-id step.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub append: bool,

    /// Render-scope locals bound by macro expansion and `foreach`.
    #[serde(skip)]
    pub bindings: BTreeMap<String, Value>,
    /// Macro-local step id -> scoped step id.
    #[serde(skip)]
    pub aliases: BTreeMap<String, String>,
}

impl RawStep {
    /// The id, which is always set once implicit ids have been assigned.
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// An input declaration: a bare source reference or a full spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawInput {
    Source(String),
    Full(RawInputSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInputSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl RawInput {
    pub fn spec(&self) -> RawInputSpec {
        match self {
            RawInput::Source(from) => RawInputSpec {
                from: Some(from.clone()),
                ..Default::default()
            },
            RawInput::Full(spec) => spec.clone(),
        }
    }
}

/// Output declarations: a list of names or a name -> spec map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawOutputs {
    Names(Vec<String>),
    Map(BTreeMap<String, RawOutput>),
}

impl Default for RawOutputs {
    fn default() -> Self {
        RawOutputs::Map(BTreeMap::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawOutput {
    Tag(String),
    Full(RawOutputSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOutputSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl RawOutputs {
    /// Normalize both forms into name -> spec.
    pub fn entries(&self) -> BTreeMap<String, RawOutputSpec> {
        match self {
            RawOutputs::Names(names) => names
                .iter()
                .map(|n| (n.clone(), RawOutputSpec::default()))
                .collect(),
            RawOutputs::Map(map) => map
                .iter()
                .map(|(name, out)| {
                    let spec = match out {
                        RawOutput::Tag(tag) => RawOutputSpec {
                            type_tag: Some(tag.clone()),
                            ..Default::default()
                        },
                        RawOutput::Full(spec) => spec.clone(),
                    };
                    (name.clone(), spec)
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RawOutputs::Names(n) => n.is_empty(),
            RawOutputs::Map(m) => m.is_empty(),
        }
    }
}

/// Cache policy: a bare policy name or a full spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCache {
    Policy(String),
    Full(RawCacheSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCacheSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub strict: bool,
}

impl RawCache {
    pub fn spec(&self) -> RawCacheSpec {
        match self {
            RawCache::Policy(p) => RawCacheSpec {
                policy: Some(p.clone()),
                ..Default::default()
            },
            RawCache::Full(spec) => spec.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<PetalDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<PetalDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
}

// ---------------------------------------------------------------------------
// Macros and profiles
// ---------------------------------------------------------------------------

/// A named, reusable list of step templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMacro {
    #[serde(default)]
    pub params: BTreeMap<String, RawParam>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

/// A named set of overrides selected at compile time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProfile {
    /// Parameter value overrides (not declarations).
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}
