//! Document composition: `extends`, overlays and profiles.
//!
//! Sources are merged as plain JSON trees so that "key absent" and "key set"
//! stay distinguishable: maps deep-merge with the rightmost layer winning,
//! while `steps` merge by id. Implicit ids are assigned per source before
//! merging, so an overlay can address `shell#2` of its base.

use std::collections::{BTreeMap, HashMap};

use petal_types::document::RawDocument;
use petal_types::lock::{Provenance, SourceRecord};
use serde_json::{Map, Value};

use crate::diagnostic::{CompileError, Diagnostic, DiagnosticKind, Diagnostics};
use crate::hashing::sha256_hex;

// ---------------------------------------------------------------------------
// Document sources
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("document '{0}' not found")]
    NotFound(String),

    #[error("failed to read '{path}': {message}")]
    Io { path: String, message: String },
}

/// A loaded source document.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Stable identifier (normally a normalized path). Used for provenance
    /// and cycle detection.
    pub id: String,
    pub text: String,
}

/// Where documents come from (filesystem in the CLI, memory in tests).
pub trait DocumentSource {
    /// Load `reference` as written in `extends`/`overlays`, resolved against
    /// the document `from` that mentions it.
    fn load(&self, reference: &str, from: Option<&str>) -> Result<LoadedDocument, SourceError>;
}

/// In-memory documents keyed by name.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    docs: BTreeMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, text: &str) -> Self {
        self.docs.insert(name.to_string(), text.to_string());
        self
    }
}

impl DocumentSource for MemorySource {
    fn load(&self, reference: &str, _from: Option<&str>) -> Result<LoadedDocument, SourceError> {
        self.docs
            .get(reference)
            .map(|text| LoadedDocument {
                id: reference.to_string(),
                text: text.clone(),
            })
            .ok_or_else(|| SourceError::NotFound(reference.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Result of loading and merging every layer.
#[derive(Debug)]
pub struct Composed {
    pub document: RawDocument,
    pub provenance: Provenance,
    /// Parameter value overrides from the selected profile.
    pub profile_params: BTreeMap<String, Value>,
    pub warnings: Vec<Diagnostic>,
}

struct Composer<'a> {
    source: &'a dyn DocumentSource,
    stack: Vec<String>,
    provenance: Provenance,
    diags: Diagnostics,
}

/// Load `root` with its `extends` chain and overlays, apply `extra_overlays`
/// and the named profile.
pub fn compose(
    source: &dyn DocumentSource,
    root: &str,
    extra_overlays: &[String],
    profile: Option<&str>,
) -> Result<Composed, CompileError> {
    let mut composer = Composer {
        source,
        stack: Vec::new(),
        provenance: Provenance::default(),
        diags: Diagnostics::new(),
    };

    let mut merged = composer.load_layer(root, None);
    let root_id = composer
        .provenance
        .sources
        .first()
        .map(|s| s.path.clone())
        .unwrap_or_else(|| root.to_string());
    for overlay in extra_overlays {
        if let (Some(base), Some(top)) = (merged.as_mut(), composer.load_overlay(overlay, &root_id)) {
            merge_documents(base, top, &mut composer.diags);
        }
    }

    let mut profile_params = BTreeMap::new();
    let mut document = None;
    if let Some(value) = merged {
        match serde_json::from_value::<RawDocument>(value) {
            Ok(mut doc) => {
                if let Some(name) = profile {
                    match doc.profiles.get(name).cloned() {
                        Some(p) => {
                            profile_params = p.params;
                            doc.vars.extend(p.vars);
                            doc.env.extend(p.env);
                            doc.defaults.extend(p.defaults);
                            composer.provenance.profile = Some(name.to_string());
                            composer.provenance.composition.push(format!("profile:{name}"));
                        }
                        None => {
                            let known: Vec<&str> = doc.profiles.keys().map(String::as_str).collect();
                            composer.diags.push(Diagnostic::validation(
                                "profiles",
                                format!("unknown profile '{name}' (available: {})", known.join(", ")),
                            ));
                        }
                    }
                }
                document = Some(doc);
            }
            Err(e) => composer
                .diags
                .push(Diagnostic::validation(root_id.as_str(), format!("invalid document: {e}"))),
        }
    }

    let warnings = composer.diags.finish("composition")?;
    let document = document.ok_or_else(|| {
        CompileError::new(
            "composition",
            vec![Diagnostic::validation(root, "no document produced")],
        )
    })?;
    Ok(Composed {
        document,
        provenance: composer.provenance,
        profile_params,
        warnings,
    })
}

impl Composer<'_> {
    fn read(&mut self, reference: &str, from: Option<&str>) -> Option<(String, Value)> {
        let loaded = match self.source.load(reference, from) {
            Ok(l) => l,
            Err(e) => {
                self.diags
                    .push(Diagnostic::validation(from.unwrap_or(reference), e.to_string()));
                return None;
            }
        };
        if self.stack.contains(&loaded.id) {
            let mut chain = self.stack.clone();
            chain.push(loaded.id.clone());
            self.diags.push(Diagnostic::validation(
                loaded.id.as_str(),
                format!("circular extends: {}", chain.join(" -> ")),
            ));
            return None;
        }
        self.provenance.sources.push(SourceRecord {
            path: loaded.id.clone(),
            sha256: sha256_hex(loaded.text.as_bytes()),
        });

        let mut value = match serde_yaml_ng::from_str::<Value>(&loaded.text) {
            Ok(v @ Value::Object(_)) => v,
            Ok(Value::Null) => Value::Object(Map::new()),
            Ok(_) => {
                self.diags.push(Diagnostic::validation(
                    loaded.id.as_str(),
                    "document must be a mapping",
                ));
                return None;
            }
            Err(e) => {
                self.diags
                    .push(Diagnostic::validation(loaded.id.as_str(), format!("invalid YAML: {e}")));
                return None;
            }
        };
        assign_implicit_ids_json(&mut value);
        Some((loaded.id, value))
    }

    /// A document plus its `extends` chain and its own overlays.
    fn load_layer(&mut self, reference: &str, from: Option<&str>) -> Option<Value> {
        let (id, mut value) = self.read(reference, from)?;
        self.stack.push(id.clone());

        let extends = take_string(&mut value, "extends");
        let overlays = take_strings(&mut value, "overlays");

        let mut merged = match extends {
            Some(Ok(base_ref)) => match self.load_layer(&base_ref, Some(&id)) {
                Some(mut base) => {
                    merge_documents(&mut base, value, &mut self.diags);
                    base
                }
                None => value,
            },
            Some(Err(())) => {
                self.diags.push(Diagnostic::validation(
                    format!("{id}: extends"),
                    "extends must name exactly one document",
                ));
                value
            }
            None => value,
        };
        self.provenance.composition.push(id.clone());

        match overlays {
            Ok(list) => {
                for overlay in list {
                    if let Some(top) = self.load_overlay(&overlay, &id) {
                        merge_documents(&mut merged, top, &mut self.diags);
                    }
                }
            }
            Err(()) => self.diags.push(Diagnostic::validation(
                format!("{id}: overlays"),
                "overlays must be a list of document names",
            )),
        }

        self.stack.pop();
        Some(merged)
    }

    fn load_overlay(&mut self, reference: &str, from: &str) -> Option<Value> {
        let (id, value) = self.read(reference, Some(from))?;
        if value.get("extends").is_some() || value.get("overlays").is_some() {
            self.diags.push(Diagnostic::validation(
                id.as_str(),
                "overlays are partial documents and cannot use extends or overlays",
            ));
            return None;
        }
        self.provenance.composition.push(format!("overlay:{id}"));
        Some(value)
    }
}

fn take_string(value: &mut Value, key: &str) -> Option<Result<String, ()>> {
    match value.as_object_mut()?.remove(key)? {
        Value::String(s) => Some(Ok(s)),
        Value::Null => None,
        _ => Some(Err(())),
    }
}

fn take_strings(value: &mut Value, key: &str) -> Result<Vec<String>, ()> {
    let Some(map) = value.as_object_mut() else {
        return Ok(Vec::new());
    };
    match map.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(()),
            })
            .collect(),
        Some(_) => Err(()),
    }
}

// ---------------------------------------------------------------------------
// Implicit ids
// ---------------------------------------------------------------------------

/// `{uses}#{n}`: n counts occurrences of the same `uses` (or macro `call`)
/// within one document, including steps that carry an explicit id.
pub fn implicit_id(kind: &str, ordinal: usize) -> String {
    format!("{kind}#{ordinal}")
}

fn assign_implicit_ids_json(doc: &mut Value) {
    let Some(steps) = doc.get_mut("steps").and_then(Value::as_array_mut) else {
        return;
    };
    let mut counts: HashMap<String, usize> = HashMap::new();
    for step in steps.iter_mut() {
        let Some(obj) = step.as_object_mut() else {
            continue;
        };
        let kind = obj
            .get("uses")
            .or_else(|| obj.get("call"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(kind) = kind else {
            continue;
        };
        let n = counts.entry(kind.clone()).or_insert(0);
        *n += 1;
        if !obj.contains_key("id") {
            obj.insert("id".to_string(), Value::String(implicit_id(&kind, *n)));
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Deep merge: objects recurse, anything else is replaced by `top`.
pub fn deep_merge(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base), Value::Object(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, top) => *slot = top,
    }
}

/// Merge `top` over `base`. Steps merge by id; everything else deep-merges.
fn merge_documents(base: &mut Value, mut top: Value, diags: &mut Diagnostics) {
    let top_steps = top.as_object_mut().and_then(|m| m.remove("steps"));
    deep_merge(base, top);

    let Some(Value::Array(top_steps)) = top_steps else {
        return;
    };
    let Some(base_obj) = base.as_object_mut() else {
        return;
    };
    let base_steps = base_obj
        .entry("steps")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = base_steps {
        merge_steps(list, top_steps, diags);
    }
}

fn step_id(step: &Value) -> Option<&str> {
    step.get("id").and_then(Value::as_str)
}

fn merge_steps(base: &mut Vec<Value>, top: Vec<Value>, diags: &mut Diagnostics) {
    for mut step in top {
        let append = step
            .as_object_mut()
            .and_then(|m| m.remove("append"))
            .is_some_and(|v| v == Value::Bool(true));
        let Some(id) = step_id(&step).map(str::to_string) else {
            base.push(step);
            continue;
        };
        let existing = base.iter().position(|s| step_id(s) == Some(id.as_str()));

        match (existing, append) {
            (Some(_), true) => diags.push(Diagnostic::error(
                DiagnosticKind::MergeConflict,
                format!("steps.{id}"),
                "step is marked append but a step with this id already exists",
            )),
            (None, _) => base.push(step),
            (Some(index), false) => {
                for key in ["uses", "call"] {
                    let inherited = base[index].get(key).cloned();
                    match (inherited, step.get(key)) {
                        (Some(a), Some(b)) if &a != b => {
                            diags.push(Diagnostic::error(
                                DiagnosticKind::MergeConflict,
                                format!("steps.{id}"),
                                format!("incompatible '{key}': {a} vs {b}"),
                            ));
                        }
                        (Some(a), None) => {
                            if let Some(obj) = step.as_object_mut() {
                                obj.insert(key.to_string(), a);
                            }
                        }
                        _ => {}
                    }
                }
                base[index] = step;
            }
        }
    }
}
