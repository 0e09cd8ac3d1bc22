//! OS keychain secret resolver.
//!
//! Uses the `keyring` crate (macOS Keychain, Linux Secret Service, Windows
//! Credential Manager). Secrets are stored under the service name `petal`
//! with the secret name as the account.

use petal_core::secrets::{SecretError, SecretResolver};
use secrecy::SecretString;

pub const DEFAULT_SERVICE: &str = "petal";

pub struct KeychainSecrets {
    service_name: String,
}

impl KeychainSecrets {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE)
    }

    /// Custom service name (useful for testing).
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, SecretError> {
        keyring::Entry::new(&self.service_name, name).map_err(|e| SecretError::Backend {
            name: name.to_string(),
            message: format!("keychain entry error: {e}"),
        })
    }
}

impl Default for KeychainSecrets {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretResolver for KeychainSecrets {
    fn resolve(&self, name: &str) -> Result<SecretString, SecretError> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(SecretString::from(value)),
            Err(keyring::Error::NoEntry) => Err(SecretError::NotFound(name.to_string())),
            Err(e) => Err(SecretError::Backend {
                name: name.to_string(),
                message: format!("keychain get error: {e}"),
            }),
        }
    }
}
