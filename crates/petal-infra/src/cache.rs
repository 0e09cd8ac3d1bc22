//! Filesystem cache store.
//!
//! One JSON file per key at `<cache_dir>/<key[..2]>/<key>.json`. Writes go
//! to a temporary file in the same directory and are renamed into place, so
//! readers never see a partial entry. Writers of the same key serialize on a
//! per-key lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use petal_core::cache::{CacheEntry, CacheError, CacheStore};

#[derive(Debug)]
pub struct FsCacheStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FsCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let fan_out = key.get(..2).unwrap_or("__");
        self.root.join(fan_out).join(format!("{key}.json"))
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key.to_string()).or_default().value())
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Store(format!("{}: {e}", path.display()))),
        };
        let entry: CacheEntry = serde_json::from_str(&raw).map_err(|e| CacheError::Integrity {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        if entry.key != key {
            return Err(CacheError::Integrity {
                key: key.to_string(),
                message: format!("entry is stored under '{}'", entry.key),
            });
        }
        Ok(Some(entry))
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.path_for(&entry.key);
        let dir = path
            .parent()
            .ok_or_else(|| CacheError::Store(format!("no parent directory for {}", path.display())))?;
        let store_err = |e: std::io::Error| CacheError::Store(format!("{}: {e}", path.display()));

        let lock = self.lock_for(&entry.key);
        let _guard = lock.lock().map_err(|_| CacheError::Store("cache lock poisoned".to_string()))?;

        std::fs::create_dir_all(dir).map_err(store_err)?;
        let raw = serde_json::to_vec_pretty(entry).map_err(|e| CacheError::Store(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(store_err)?;
        std::io::Write::write_all(&mut tmp, &raw).map_err(store_err)?;
        tmp.persist(&path).map_err(|e| store_err(e.error))?;
        tracing::debug!(key = %entry.key, step_id = %entry.provenance.step_id, "cache entry written");
        Ok(())
    }
}
