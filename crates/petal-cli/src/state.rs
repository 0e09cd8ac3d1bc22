//! Application state wiring settings, stores and adapters together.
//!
//! The engine is generic over its run store; `AppState` pins it to the
//! filesystem implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use petal_core::adapter::AdapterRegistry;
use petal_core::engine::{Engine, RunOptions};
use petal_core::event::EventBus;
use petal_infra::adapter::build_registry;
use petal_infra::cache::FsCacheStore;
use petal_infra::config::load_settings;
use petal_infra::keychain::KeychainSecrets;
use petal_infra::run_dir::FsRunStore;
use petal_infra::secret::build_secret_chain;
use petal_infra::source::FsDocumentSource;
use petal_types::config::Settings;

pub type ConcreteEngine = Engine<FsRunStore>;

pub struct AppState {
    pub project_dir: PathBuf,
    pub settings: Settings,
    pub source: FsDocumentSource,
    pub registry: AdapterRegistry,
    pub engine: ConcreteEngine,
}

impl AppState {
    /// Load settings for `project_dir` and wire the engine. A `parallelism`
    /// flag overrides the settings file.
    pub async fn init(project_dir: &Path, parallelism: Option<usize>) -> anyhow::Result<Self> {
        let mut settings = load_settings(project_dir).await;
        if let Some(n) = parallelism {
            settings.parallelism = n.max(1);
        }

        let registry = build_registry(&settings);
        let cache = FsCacheStore::new(resolve(project_dir, &settings.cache_dir));
        let store = FsRunStore::new(resolve(project_dir, &settings.run_root));
        let secrets = build_secret_chain(Some(KeychainSecrets::new()));
        let engine = Engine::new(
            registry.clone(),
            Arc::new(cache),
            Arc::new(secrets),
            Arc::new(store),
            EventBus::new(settings.event_capacity),
        );

        tracing::debug!(
            project = %project_dir.display(),
            parallelism = settings.parallelism,
            adapters = ?registry,
            "application state ready"
        );

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            source: FsDocumentSource::new(project_dir),
            settings,
            registry,
            engine,
        })
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            env: std::env::vars().collect(),
            ..RunOptions::from_settings(&self.settings)
        }
    }

    /// A user-supplied path relative to the current directory, made
    /// relative to the project root where possible.
    pub fn document_ref(&self, path: &Path) -> String {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
        };
        absolute
            .strip_prefix(&self.project_dir)
            .unwrap_or(&absolute)
            .to_string_lossy()
            .into_owned()
    }
}

fn resolve(project_dir: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        project_dir.join(configured)
    }
}
