//! Run store port: where a run's events, state and manifest go.
//!
//! The filesystem implementation lives in `petal-infra` and writes
//! `<run_root>/<run_id>/{events.jsonl,state.json,manifest.json}`.

use std::future::Future;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use petal_types::run::{Event, RunManifest, RunSnapshot};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run store I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("run store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence for run state. Uses native async fn in traits.
pub trait RunStore: Send + Sync {
    /// Directory adapters work in and outputs materialize under.
    fn run_dir(&self, run_id: Uuid) -> PathBuf;

    /// Append one event. Concurrent appends must not interleave.
    fn append_event(&self, event: &Event) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn save_snapshot(&self, snapshot: &RunSnapshot) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_snapshot(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Option<RunSnapshot>, StoreError>> + Send;

    fn save_manifest(&self, manifest: &RunManifest) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// In-memory store for tests and dry runs. Run directories are created
/// under `root`.
#[derive(Debug)]
pub struct MemoryRunStore {
    root: PathBuf,
    events: DashMap<Uuid, Vec<Event>>,
    snapshots: DashMap<Uuid, RunSnapshot>,
    manifests: DashMap<Uuid, RunManifest>,
}

impl MemoryRunStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            events: DashMap::new(),
            snapshots: DashMap::new(),
            manifests: DashMap::new(),
        }
    }

    pub fn events(&self, run_id: Uuid) -> Vec<Event> {
        self.events.get(&run_id).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn manifest(&self, run_id: Uuid) -> Option<RunManifest> {
        self.manifests.get(&run_id).map(|m| m.clone())
    }
}

impl RunStore for MemoryRunStore {
    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.entry(event.run_id).or_default().push(event.clone());
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
        self.snapshots.insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError> {
        Ok(self.snapshots.get(&run_id).map(|s| s.clone()))
    }

    async fn save_manifest(&self, manifest: &RunManifest) -> Result<(), StoreError> {
        self.manifests.insert(manifest.run_id, manifest.clone());
        Ok(())
    }
}
