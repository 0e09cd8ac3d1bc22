//! Engine settings loaded from `petal.toml`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::duration::PetalDuration;

/// Settings shared by the CLI, the engine and the adapters.
///
/// Every field has a default so a partial (or missing) `petal.toml` works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum steps dispatched concurrently within a layer.
    pub parallelism: usize,
    /// Root directory for per-run directories.
    pub run_root: PathBuf,
    /// Filesystem cache location.
    pub cache_dir: PathBuf,
    /// Step timeout when a step does not set one.
    pub default_timeout: PetalDuration,
    /// First retry delay when a step does not set one.
    pub retry_base_delay: PetalDuration,
    /// Upper bound for any retry delay.
    pub retry_max_delay: PetalDuration,
    /// Container runtime binary.
    pub container_runtime: String,
    /// Timeout for HTTP and LLM requests.
    pub http_timeout: PetalDuration,
    /// Broadcast channel capacity for run events.
    pub event_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            run_root: PathBuf::from(".petal/runs"),
            cache_dir: PathBuf::from(".petal/cache"),
            default_timeout: PetalDuration::from_secs(300),
            retry_base_delay: PetalDuration::from_millis(200),
            retry_max_delay: PetalDuration::from_secs(30),
            container_runtime: "docker".to_string(),
            http_timeout: PetalDuration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
parallelism = 8
default_timeout = "90s"
"#,
        )
        .unwrap();
        assert_eq!(settings.parallelism, 8);
        assert_eq!(settings.default_timeout, PetalDuration::from_secs(90));
        assert_eq!(settings.container_runtime, "docker");
        assert_eq!(settings.event_capacity, 1024);
    }
}
