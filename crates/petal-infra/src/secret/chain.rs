//! Secret chain builder: wires concrete resolvers in priority order.
//!
//! Default order: `[EnvSecrets, KeychainSecrets]`.

use std::sync::Arc;

use petal_core::secrets::{SecretError, SecretResolver};
use secrecy::SecretString;

use crate::keychain::KeychainSecrets;
use crate::secret::env::EnvSecrets;

/// First resolver that knows a name wins. Backend errors are logged and the
/// next resolver is tried.
#[derive(Default, Clone)]
pub struct SecretChain {
    resolvers: Vec<Arc<dyn SecretResolver>>,
}

impl SecretChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, resolver: impl SecretResolver + 'static) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl SecretResolver for SecretChain {
    fn resolve(&self, name: &str) -> Result<SecretString, SecretError> {
        for resolver in &self.resolvers {
            match resolver.resolve(name) {
                Ok(value) => return Ok(value),
                Err(SecretError::NotFound(_)) => {}
                Err(e) => tracing::warn!(secret = %name, error = %e, "secret backend failed; trying next"),
            }
        }
        Err(SecretError::NotFound(name.to_string()))
    }
}

/// Build the default resolution chain.
///
/// 1. Environment variables (always)
/// 2. OS keychain (if `keychain` is Some; may be unavailable on headless hosts)
pub fn build_secret_chain(keychain: Option<KeychainSecrets>) -> SecretChain {
    let chain = SecretChain::new().push(EnvSecrets::new());
    match keychain {
        Some(kc) => chain.push(kc),
        None => chain,
    }
}
