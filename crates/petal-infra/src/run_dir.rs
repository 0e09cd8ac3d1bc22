//! Per-run directories on disk.
//!
//! Layout: `<run_root>/<run_id>/`
//! - `events.jsonl` -- one event per line, append-only
//! - `state.json` -- latest run snapshot (read by resume)
//! - `manifest.json` -- end-of-run summary
//!
//! Step outputs with a `path` materialize under the same directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use petal_core::store::{RunStore, StoreError};
use petal_types::run::{Event, RunManifest, RunSnapshot};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const STATE_FILE: &str = "state.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug)]
pub struct FsRunStore {
    root: PathBuf,
    /// Serializes event appends per run.
    appenders: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl FsRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            appenders: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn load_manifest(&self, run_id: Uuid) -> Result<Option<RunManifest>, StoreError> {
        read_json(&self.run_dir(run_id).join(MANIFEST_FILE)).await
    }

    async fn ensure_dir(&self, run_id: Uuid) -> Result<PathBuf, StoreError> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| io_error(&dir, e))?;
        Ok(dir)
    }
}

impl RunStore for FsRunStore {
    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let lock = Arc::clone(self.appenders.entry(event.run_id).or_default().value());
        let _guard = lock.lock().await;

        let path = self.ensure_dir(event.run_id).await?.join(EVENTS_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(&line).await.map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))
    }

    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
        let dir = self.ensure_dir(snapshot.run_id).await?;
        write_json(&dir.join(STATE_FILE), snapshot).await
    }

    async fn load_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError> {
        read_json(&self.run_dir(run_id).join(STATE_FILE)).await
    }

    async fn save_manifest(&self, manifest: &RunManifest) -> Result<(), StoreError> {
        let dir = self.ensure_dir(manifest.run_id).await?;
        write_json(&dir.join(MANIFEST_FILE), manifest).await
    }
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Write pretty JSON via a sibling temp file and rename.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await.map_err(|e| io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}
