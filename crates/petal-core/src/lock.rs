//! Lock artifacts: build, hash, verify and diff.
//!
//! `spec_hash` covers the resolved plan only. Provenance is excluded so that
//! moving source files around does not change it, and the derived `layers`
//! and `cache_formulas` are excluded because they are recomputed from the
//! steps, pins and params that the hash already covers.

use std::collections::{BTreeMap, BTreeSet};

use petal_types::lock::{LOCK_SCHEMA_VERSION, LockFile, Provenance};
use petal_types::step::CanonicalStep;
use serde_json::Value;

use crate::cache::{formula, params_namespace};
use crate::compiler::compose::DocumentSource;
use crate::dag::{self, PlanError};
use crate::hashing::{canonical_json, sha256_hex};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock artifact is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("lock schema version {found} is not supported (expected {LOCK_SCHEMA_VERSION})")]
    SchemaVersion { found: u32 },
}

/// Everything the compiler resolved, ready to be frozen into a lock.
#[derive(Debug, Clone)]
pub struct LockParts {
    pub name: String,
    pub description: Option<String>,
    pub provenance: Provenance,
    pub pins: BTreeMap<String, String>,
    pub params: BTreeMap<String, Value>,
    pub vars: BTreeMap<String, Value>,
    pub env: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    pub steps: Vec<CanonicalStep>,
    pub layers: Vec<Vec<String>>,
}

/// Assemble a lock, computing cache formulas and `spec_hash`.
pub fn build_lock(parts: LockParts) -> LockFile {
    let namespace = params_namespace(&parts.params);
    let cache_formulas = parts
        .steps
        .iter()
        .map(|step| {
            let version = parts.pins.get(step.uses.tag()).map(String::as_str).unwrap_or_default();
            (step.id.clone(), formula(step, version, &namespace))
        })
        .collect();
    let mut lock = LockFile {
        schema_version: LOCK_SCHEMA_VERSION,
        name: parts.name,
        description: parts.description,
        provenance: parts.provenance,
        spec_hash: String::new(),
        pins: parts.pins,
        params: parts.params,
        vars: parts.vars,
        env: parts.env,
        secrets: parts.secrets,
        steps: parts.steps,
        layers: parts.layers,
        cache_formulas,
    };
    lock.spec_hash = spec_hash(&lock);
    lock
}

/// SHA-256 over the canonical JSON of the hashed fields.
pub fn spec_hash(lock: &LockFile) -> String {
    let mut value = serde_json::to_value(lock).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for field in ["provenance", "spec_hash", "layers", "cache_formulas"] {
            map.remove(field);
        }
    }
    sha256_hex(canonical_json(&value).as_bytes())
}

/// Parse a lock artifact. Nothing is re-rendered or re-merged.
pub fn load_lock(text: &str) -> Result<LockFile, LockError> {
    let lock: LockFile = serde_json::from_str(text)?;
    if lock.schema_version != LOCK_SCHEMA_VERSION {
        return Err(LockError::SchemaVersion {
            found: lock.schema_version,
        });
    }
    Ok(lock)
}

pub fn to_pretty_json(lock: &LockFile) -> Result<String, LockError> {
    Ok(serde_json::to_string_pretty(lock)?)
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    HashMismatch { recorded: String, computed: String },
    StaleSource { path: String },
    UnreadableSource { path: String, message: String },
    LayerDrift,
    Plan(PlanError),
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Finding::HashMismatch { recorded, computed } => {
                write!(f, "spec_hash mismatch: recorded {recorded}, computed {computed}")
            }
            Finding::StaleSource { path } => write!(f, "source '{path}' changed since the lock was written"),
            Finding::UnreadableSource { path, message } => write!(f, "source '{path}' could not be read: {message}"),
            Finding::LayerDrift => write!(f, "stored layers do not match the steps"),
            Finding::Plan(e) => write!(f, "{e}"),
        }
    }
}

impl Finding {
    /// Unreadable sources are reported but do not fail verification.
    pub fn is_problem(&self) -> bool {
        !matches!(self, Finding::UnreadableSource { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub findings: Vec<Finding>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        !self.findings.iter().any(Finding::is_problem)
    }
}

/// Recompute the hash, re-plan the stored steps and, when a source is
/// given, compare the recorded source digests.
pub fn verify(lock: &LockFile, source: Option<&dyn DocumentSource>) -> VerifyReport {
    let mut findings = Vec::new();

    let computed = spec_hash(lock);
    if computed != lock.spec_hash {
        findings.push(Finding::HashMismatch {
            recorded: lock.spec_hash.clone(),
            computed,
        });
    }

    match dag::plan(&lock.steps) {
        Ok(plan) if plan.layers != lock.layers => findings.push(Finding::LayerDrift),
        Ok(_) => {}
        Err(errors) => findings.extend(errors.into_iter().map(Finding::Plan)),
    }

    if let Some(source) = source {
        for record in &lock.provenance.sources {
            match source.load(&record.path, None) {
                Ok(doc) if sha256_hex(doc.text.as_bytes()) != record.sha256 => {
                    findings.push(Finding::StaleSource {
                        path: record.path.clone(),
                    });
                }
                Ok(_) => {}
                Err(e) => findings.push(Finding::UnreadableSource {
                    path: record.path.clone(),
                    message: e.to_string(),
                }),
            }
        }
    }

    VerifyReport { findings }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added,
    Removed,
    Changed(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockDiff {
    pub steps: BTreeMap<String, Change>,
    /// Parameter name -> (old, new); `None` when absent on that side.
    pub params: BTreeMap<String, (Option<Value>, Option<Value>)>,
    pub pins: BTreeMap<String, (Option<String>, Option<String>)>,
    pub spec_hash_changed: bool,
}

impl LockDiff {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.params.is_empty() && self.pins.is_empty() && !self.spec_hash_changed
    }
}

pub fn diff(old: &LockFile, new: &LockFile) -> LockDiff {
    let before: BTreeMap<&str, &CanonicalStep> = old.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let after: BTreeMap<&str, &CanonicalStep> = new.steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut steps = BTreeMap::new();
    for (id, a) in &before {
        match after.get(id) {
            None => {
                steps.insert(id.to_string(), Change::Removed);
            }
            Some(b) => {
                let fields = changed_fields(a, b);
                if !fields.is_empty() {
                    steps.insert(id.to_string(), Change::Changed(fields));
                }
            }
        }
    }
    for id in after.keys().filter(|id| !before.contains_key(*id)) {
        steps.insert(id.to_string(), Change::Added);
    }

    LockDiff {
        steps,
        params: map_diff(&old.params, &new.params),
        pins: map_diff(&old.pins, &new.pins),
        spec_hash_changed: old.spec_hash != new.spec_hash,
    }
}

/// Top-level step fields whose serialized values differ.
fn changed_fields(a: &CanonicalStep, b: &CanonicalStep) -> Vec<String> {
    let as_map = |s: &CanonicalStep| match serde_json::to_value(s) {
        Ok(Value::Object(map)) => map,
        _ => Default::default(),
    };
    let (a, b) = (as_map(a), as_map(b));
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter()
        .filter(|k| a.get(*k) != b.get(*k))
        .map(|k| k.to_string())
        .collect()
}

fn map_diff<V: Clone + PartialEq>(
    a: &BTreeMap<String, V>,
    b: &BTreeMap<String, V>,
) -> BTreeMap<String, (Option<V>, Option<V>)> {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter()
        .filter(|k| a.get(*k) != b.get(*k))
        .map(|k| (k.clone(), (a.get(k).cloned(), b.get(k).cloned())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compose::MemorySource;
    use petal_types::lock::SourceRecord;
    use petal_types::step::{AdapterKind, CacheSettings, ErrorPolicy, RetryPolicy};
    use serde_json::json;

    fn step(id: &str, needs: &[&str], run: &str) -> CanonicalStep {
        CanonicalStep {
            id: id.to_string(),
            uses: AdapterKind::Shell,
            needs: needs.iter().map(|s| s.to_string()).collect(),
            condition: None,
            inputs: Default::default(),
            outputs: Default::default(),
            config: json!({"run": run}),
            deferred: Vec::new(),
            bindings: Default::default(),
            aliases: Default::default(),
            secrets: Vec::new(),
            cache: CacheSettings::default(),
            resources: Default::default(),
            retry: RetryPolicy::default(),
            timeout: None,
            if_error: ErrorPolicy::Fail,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn parts(steps: Vec<CanonicalStep>) -> LockParts {
        let layers = dag::plan(&steps).unwrap().layers;
        LockParts {
            name: "demo".to_string(),
            description: None,
            provenance: Provenance {
                sources: vec![SourceRecord {
                    path: "app.yaml".to_string(),
                    sha256: sha256_hex(b"original"),
                }],
                composition: vec!["document:app.yaml".to_string()],
                profile: None,
            },
            pins: BTreeMap::from([("shell".to_string(), "1".to_string())]),
            params: BTreeMap::from([("target".to_string(), json!("x"))]),
            vars: BTreeMap::new(),
            env: BTreeMap::new(),
            secrets: Vec::new(),
            steps,
            layers,
        }
    }

    #[test]
    fn test_hash_ignores_provenance() {
        let a = build_lock(parts(vec![step("a", &[], "make")]));
        let mut moved = parts(vec![step("a", &[], "make")]);
        moved.provenance.sources[0].path = "elsewhere/app.yaml".to_string();
        let b = build_lock(moved);
        assert_eq!(a.spec_hash, b.spec_hash);

        let mut other = parts(vec![step("a", &[], "make")]);
        other.params.insert("target".to_string(), json!("y"));
        let c = build_lock(other);
        assert_ne!(a.spec_hash, c.spec_hash);
        assert_ne!(a.cache_formulas["a"].namespace, c.cache_formulas["a"].namespace);
    }

    #[test]
    fn test_roundtrip_and_schema_version() {
        let lock = build_lock(parts(vec![step("a", &[], "make"), step("b", &["a"], "test")]));
        let text = to_pretty_json(&lock).unwrap();
        let loaded = load_lock(&text).unwrap();
        assert_eq!(loaded, lock);
        assert_eq!(spec_hash(&loaded), lock.spec_hash);

        let mut value: Value = serde_json::from_str(&text).unwrap();
        value["schema_version"] = json!(99);
        let err = load_lock(&value.to_string()).unwrap_err();
        assert!(matches!(err, LockError::SchemaVersion { found: 99 }));
    }

    #[test]
    fn test_verify_findings() {
        let lock = build_lock(parts(vec![step("a", &[], "make"), step("b", &["a"], "test")]));
        let same = MemorySource::new().with("app.yaml", "original");
        assert!(verify(&lock, Some(&same)).findings.is_empty());

        let changed = MemorySource::new().with("app.yaml", "edited");
        let report = verify(&lock, Some(&changed));
        assert!(!report.is_ok());
        assert_eq!(report.findings, vec![Finding::StaleSource { path: "app.yaml".to_string() }]);

        let missing = MemorySource::new();
        let report = verify(&lock, Some(&missing));
        assert!(report.is_ok());
        assert_eq!(report.findings.len(), 1);

        let mut tampered = lock.clone();
        tampered.steps[1].config = json!({"run": "rm -rf /"});
        tampered.layers = vec![vec!["a".to_string(), "b".to_string()]];
        let report = verify(&tampered, None);
        assert!(matches!(report.findings[0], Finding::HashMismatch { .. }));
        assert_eq!(report.findings[1], Finding::LayerDrift);
    }

    #[test]
    fn test_diff() {
        let old = build_lock(parts(vec![step("a", &[], "make"), step("b", &["a"], "test")]));
        let mut next = parts(vec![step("a", &[], "make all"), step("c", &["a"], "lint")]);
        next.pins.insert("shell".to_string(), "2".to_string());
        next.params.insert("extra".to_string(), json!(true));
        let new = build_lock(next);

        let d = diff(&old, &new);
        assert_eq!(d.steps["a"], Change::Changed(vec!["config".to_string()]));
        assert_eq!(d.steps["b"], Change::Removed);
        assert_eq!(d.steps["c"], Change::Added);
        assert_eq!(d.params["extra"], (None, Some(json!(true))));
        assert_eq!(d.pins["shell"], (Some("1".to_string()), Some("2".to_string())));
        assert!(d.spec_hash_changed);
        assert!(diff(&old, &old).is_empty());
    }
}
