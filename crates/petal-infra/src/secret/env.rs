//! Environment variable secret resolver.
//!
//! Looks up `PETAL_SECRET_<NAME>` first, then `<NAME>` itself. Values that
//! are not valid Unicode count as missing.

use petal_core::secrets::{SecretError, SecretResolver};
use secrecy::SecretString;

/// Prefix for Petal-specific secret variables.
pub const ENV_PREFIX: &str = "PETAL_SECRET_";

#[derive(Debug, Clone, Default)]
pub struct EnvSecrets;

impl EnvSecrets {
    pub fn new() -> Self {
        Self
    }
}

impl SecretResolver for EnvSecrets {
    fn resolve(&self, name: &str) -> Result<SecretString, SecretError> {
        let prefixed = format!("{ENV_PREFIX}{name}");
        [prefixed.as_str(), name]
            .into_iter()
            .find_map(|var| std::env::var(var).ok())
            .map(SecretString::from)
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}
