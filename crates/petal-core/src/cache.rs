//! Content-addressed step cache.
//!
//! A key is the SHA-256 of the canonical JSON of:
//! adapter + adapter version, the rendered config (volatile fields removed
//! unless the step is strict), input digests, the declared output names, the
//! resolved-parameter namespace and the explicit `cache.key`.
//!
//! Secrets never reach a key: config still carries redaction tokens when the
//! key is computed, and secret-typed inputs hash as a token derived from the
//! secret's name.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use petal_types::lock::CacheKeyFormula;
use petal_types::step::{AdapterKind, CanonicalStep, InputSpec};
use petal_types::value_type::TypeTag;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::hashing::{canonical_json, digest_value, sha256_hex};
use crate::secrets::secret_token;

// ---------------------------------------------------------------------------
// Entries and store port
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A stored entry cannot be decoded. Callers treat this as a miss.
    #[error("cache entry '{key}' is corrupt: {message}")]
    Integrity { key: String, message: String },

    #[error("cache store error: {0}")]
    Store(String),
}

/// Where a cached result came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheProvenance {
    pub step_id: String,
    pub adapter: AdapterKind,
    pub adapter_version: String,
    pub config_digest: String,
    pub input_digests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub outputs: BTreeMap<String, Value>,
    pub provenance: CacheProvenance,
    pub created_at: DateTime<Utc>,
}

/// Storage for cache entries. Readers may run concurrently; writes to the
/// same key are last-writer-wins.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;
}

/// In-process store. Entries are kept serialized so decoding failures
/// surface the same way they do for on-disk stores.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, String>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store raw bytes under a key (used to simulate corruption).
    pub fn insert_raw(&self, key: &str, raw: &str) {
        self.entries.insert(key.to_string(), raw.to_string());
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(raw) = self.entries.get(key) else {
            return Ok(None);
        };
        serde_json::from_str(raw.value())
            .map(Some)
            .map_err(|e| CacheError::Integrity {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let raw = serde_json::to_string(entry).map_err(|e| CacheError::Store(e.to_string()))?;
        self.entries.insert(entry.key.clone(), raw);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Digest of the resolved parameters. Different parameter sets never share
/// cache entries.
pub fn params_namespace(params: &BTreeMap<String, Value>) -> String {
    digest_value(&json!(params))
}

/// Config with volatile fields removed (unless strict), plus the names
/// that were removed.
pub fn stable_config(step: &CanonicalStep) -> (Value, Vec<String>) {
    let mut config = step.config.clone();
    let mut removed = Vec::new();
    if !step.cache.strict {
        if let Value::Object(map) = &mut config {
            for field in step.uses.volatile_fields() {
                if map.remove(*field).is_some() {
                    removed.push(field.to_string());
                }
            }
        }
    }
    (config, removed)
}

/// Digest of one resolved input value.
pub fn input_digest(spec: &InputSpec, value: &Value) -> String {
    match (spec.type_tag, value) {
        (TypeTag::Secret, Value::String(name)) => {
            let token = if name.starts_with("<<secret:") {
                name.clone()
            } else {
                secret_token(name)
            };
            sha256_hex(token.as_bytes())
        }
        (TypeTag::File, Value::String(path)) => match std::fs::read(path) {
            Ok(bytes) => format!("file:{}", sha256_hex(&bytes)),
            Err(_) => digest_value(value),
        },
        (TypeTag::Dir, Value::String(path)) => {
            dir_digest(Path::new(path)).unwrap_or_else(|| digest_value(value))
        }
        _ => digest_value(value),
    }
}

/// Digest over relative paths and contents of every file under `root`.
fn dir_digest(root: &Path) -> Option<String> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else {
                let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().into_owned();
                out.insert(rel, sha256_hex(&std::fs::read(&path)?));
            }
        }
        Ok(())
    }
    let mut files = BTreeMap::new();
    walk(root, root, &mut files).ok()?;
    Some(format!("dir:{}", digest_value(&json!(files))))
}

/// Cache key for a rendered step and its resolved inputs.
pub fn cache_key(
    step: &CanonicalStep,
    adapter_version: &str,
    namespace: &str,
    inputs: &BTreeMap<String, Value>,
) -> String {
    let (config, _) = stable_config(step);
    let input_digests: BTreeMap<&str, String> = step
        .inputs
        .iter()
        .map(|(name, spec)| {
            let value = inputs.get(name).unwrap_or(&Value::Null);
            (name.as_str(), input_digest(spec, value))
        })
        .collect();
    let outputs: Vec<&str> = step.outputs.keys().map(String::as_str).collect();
    let material = json!({
        "adapter": step.uses.tag(),
        "adapter_version": adapter_version,
        "config": config,
        "inputs": input_digests,
        "outputs": outputs,
        "namespace": namespace,
        "key": step.cache.key,
    });
    sha256_hex(canonical_json(&material).as_bytes())
}

/// Static description of how a step's key is derived, stored in the lock.
pub fn formula(step: &CanonicalStep, adapter_version: &str, namespace: &str) -> CacheKeyFormula {
    let (config, volatile_excluded) = stable_config(step);
    CacheKeyFormula {
        policy: step.cache.policy,
        adapter: step.uses,
        adapter_version: adapter_version.to_string(),
        namespace: namespace.to_string(),
        config_digest: digest_value(&config),
        volatile_excluded,
        inputs: step
            .inputs
            .iter()
            .map(|(name, spec)| format!("{name}:{}", spec.type_tag))
            .collect(),
        outputs: step.outputs.keys().cloned().collect(),
        explicit_key: step.cache.key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_types::step::{CacheSettings, ErrorPolicy, OutputSpec, RetryPolicy};
    use tempfile::TempDir;

    fn llm_step() -> CanonicalStep {
        CanonicalStep {
            id: "summarize".to_string(),
            uses: AdapterKind::Llm,
            needs: Vec::new(),
            condition: None,
            inputs: BTreeMap::from([(
                "doc".to_string(),
                InputSpec {
                    from: None,
                    value: None,
                    type_tag: TypeTag::File,
                    required: true,
                },
            )]),
            outputs: BTreeMap::from([(
                "text".to_string(),
                OutputSpec {
                    type_tag: TypeTag::String,
                    required: true,
                    path: None,
                },
            )]),
            config: json!({"model": "m", "prompt": "p", "temperature": 0.7, "api_key": "<<secret:KEY>>"}),
            deferred: Vec::new(),
            bindings: BTreeMap::new(),
            aliases: BTreeMap::new(),
            secrets: vec!["KEY".to_string()],
            cache: CacheSettings::default(),
            resources: Default::default(),
            retry: RetryPolicy::default(),
            timeout: None,
            if_error: ErrorPolicy::Fail,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    #[test]
    fn test_volatile_fields_respect_strict() {
        let mut step = llm_step();
        let ns = params_namespace(&BTreeMap::new());
        let inputs = BTreeMap::new();
        let a = cache_key(&step, "1", &ns, &inputs);
        step.config["temperature"] = json!(0.1);
        assert_eq!(a, cache_key(&step, "1", &ns, &inputs));

        step.cache.strict = true;
        let strict = cache_key(&step, "1", &ns, &inputs);
        assert_ne!(a, strict);
        assert!(formula(&step, "1", &ns).volatile_excluded.is_empty());
        step.cache.strict = false;
        assert_eq!(formula(&step, "1", &ns).volatile_excluded, vec!["temperature"]);
    }

    #[test]
    fn test_key_components() {
        let step = llm_step();
        let inputs = BTreeMap::new();
        let ns_a = params_namespace(&BTreeMap::from([("x".to_string(), json!(1))]));
        let ns_b = params_namespace(&BTreeMap::from([("x".to_string(), json!(2))]));
        let base = cache_key(&step, "1", &ns_a, &inputs);
        assert_ne!(base, cache_key(&step, "1", &ns_b, &inputs));
        assert_ne!(base, cache_key(&step, "2", &ns_a, &inputs));

        let mut keyed = step.clone();
        keyed.cache.key = Some("v2".to_string());
        assert_ne!(base, cache_key(&keyed, "1", &ns_a, &inputs));

        let mut more_outputs = step.clone();
        more_outputs.outputs.insert(
            "extra".to_string(),
            OutputSpec {
                type_tag: TypeTag::Json,
                required: false,
                path: None,
            },
        );
        assert_ne!(base, cache_key(&more_outputs, "1", &ns_a, &inputs));
    }

    #[test]
    fn test_file_inputs_hash_content_not_path() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();
        let step = llm_step();
        let ns = params_namespace(&BTreeMap::new());
        let key = |p: &Path| {
            let inputs = BTreeMap::from([("doc".to_string(), json!(p.to_string_lossy()))]);
            cache_key(&step, "1", &ns, &inputs)
        };
        assert_eq!(key(&a), key(&b));
        std::fs::write(&b, "different").unwrap();
        assert_ne!(key(&a), key(&b));
    }

    #[test]
    fn test_secret_inputs_hash_by_name() {
        let spec = InputSpec {
            from: None,
            value: None,
            type_tag: TypeTag::Secret,
            required: true,
        };
        assert_eq!(
            input_digest(&spec, &json!("API_KEY")),
            input_digest(&spec, &json!("<<secret:API_KEY>>"))
        );
        assert_ne!(input_digest(&spec, &json!("API_KEY")), input_digest(&spec, &json!("OTHER")));
    }

    #[test]
    fn test_memory_store_roundtrip_and_corruption() {
        let store = MemoryCacheStore::new();
        assert!(store.get("k").unwrap().is_none());
        let entry = CacheEntry {
            key: "k".to_string(),
            outputs: BTreeMap::from([("text".to_string(), json!("hi"))]),
            provenance: CacheProvenance {
                step_id: "s".to_string(),
                adapter: AdapterKind::Shell,
                adapter_version: "1".to_string(),
                config_digest: "c".to_string(),
                input_digests: BTreeMap::new(),
            },
            created_at: Utc::now(),
        };
        store.put(&entry).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(entry));

        store.insert_raw("bad", "{not json");
        assert!(matches!(store.get("bad"), Err(CacheError::Integrity { .. })));
    }
}
