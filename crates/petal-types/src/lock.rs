//! Lock artifact: a fully-resolved plan with pins and provenance.
//!
//! The engine executes a loaded lock as-is. Nothing in it is re-merged or
//! re-rendered, apart from the templates each step marks as deferred.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::{AdapterKind, CachePolicy, CanonicalStep};

/// Current lock schema version.
pub const LOCK_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
    pub schema_version: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub provenance: Provenance,
    /// SHA-256 over everything except provenance and derived layering.
    pub spec_hash: String,
    /// Adapter tag -> pinned version.
    pub pins: BTreeMap<String, String>,
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    pub steps: Vec<CanonicalStep>,
    pub layers: Vec<Vec<String>>,
    pub cache_formulas: BTreeMap<String, CacheKeyFormula>,
}

impl LockFile {
    pub fn step(&self, id: &str) -> Option<&CanonicalStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Where the plan came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub sources: Vec<SourceRecord>,
    /// Composition order, e.g. `["extends:base.yaml", "document:app.yaml", "profile:ci"]`.
    pub composition: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub path: String,
    pub sha256: String,
}

/// The components a step's cache key is derived from.
///
/// Input values are only known at dispatch, so the formula names them; the
/// static parts are digested here so two locks can be compared without
/// running anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKeyFormula {
    pub policy: CachePolicy,
    pub adapter: AdapterKind,
    pub adapter_version: String,
    /// Resolved-parameter digest; different parameter sets never share entries.
    pub namespace: String,
    /// Digest of the rendered config with volatile fields removed.
    pub config_digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volatile_excluded: Vec<String>,
    /// `name:type` for each declared input.
    pub inputs: Vec<String>,
    /// Declared output names.
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_key: Option<String>,
}
