//! Secret resolver implementations.
//!
//! - `env`: environment variables (highest priority)
//! - `chain`: first-match-wins chain over several resolvers
//!
//! The OS keychain resolver lives in [`crate::keychain`].

pub mod chain;
pub mod env;

pub use chain::{SecretChain, build_secret_chain};
pub use env::EnvSecrets;
