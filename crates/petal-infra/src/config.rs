//! Settings loader for Petal.
//!
//! Reads `petal.toml` from the project directory, falling back to
//! `~/.petal/config.toml`. Falls back to defaults when neither file exists
//! or the one found is malformed.

use std::path::{Path, PathBuf};

use petal_types::config::Settings;

/// Project-level settings file name.
pub const SETTINGS_FILE: &str = "petal.toml";

/// `~/.petal/config.toml`, when a home directory is known.
pub fn user_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".petal").join("config.toml"))
}

/// Load settings for a project rooted at `project_dir`.
///
/// - `petal.toml` in the project wins over the user-level file.
/// - A missing file means defaults.
/// - A file that fails to read or parse logs a warning and yields defaults.
pub async fn load_settings(project_dir: &Path) -> Settings {
    let candidates = std::iter::once(project_dir.join(SETTINGS_FILE)).chain(user_settings_path());
    for path in candidates {
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => return parse_settings(&path, &content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
                return Settings::default();
            }
        }
    }
    tracing::debug!("No settings file found under {}, using defaults", project_dir.display());
    Settings::default()
}

fn parse_settings(path: &Path, content: &str) -> Settings {
    match toml::from_str::<Settings>(content) {
        Ok(settings) => {
            tracing::debug!(path = %path.display(), "loaded settings");
            settings
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            Settings::default()
        }
    }
}
