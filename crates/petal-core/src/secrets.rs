//! Secrets port.
//!
//! The core never stores a resolved secret. Rendered configuration carries
//! redaction tokens (`<<secret:NAME>>`); the engine swaps tokens for real
//! values only in the payload handed to the adapter of the step that
//! declared the secret.

use std::collections::BTreeMap;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const TOKEN_PREFIX: &str = "<<secret:";
const TOKEN_SUFFIX: &str = ">>";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("secret backend error for '{name}': {message}")]
    Backend { name: String, message: String },
}

/// Resolves secret names to values (`resolve(name) -> value | NotFound`).
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<SecretString, SecretError>;

    /// Existence check used by `if: secrets.NAME`.
    fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }
}

/// Redaction token for a secret name.
pub fn secret_token(name: &str) -> String {
    format!("{TOKEN_PREFIX}{name}{TOKEN_SUFFIX}")
}

/// Resolver over a fixed in-memory map.
#[derive(Default)]
pub struct StaticSecrets(BTreeMap<String, String>);

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve(&self, name: &str) -> Result<SecretString, SecretError> {
        self.0
            .get(name)
            .map(|v| SecretString::from(v.clone()))
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

/// Replace redaction tokens for `allowed` secrets inside every string of
/// `payload`. Tokens naming other secrets are left untouched.
pub fn substitute_secrets(
    payload: &mut Value,
    allowed: &[String],
    resolver: &dyn SecretResolver,
) -> Result<(), SecretError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let mut resolved: BTreeMap<&str, SecretString> = BTreeMap::new();
    for name in allowed {
        if contains_token(payload, name) {
            resolved.insert(name.as_str(), resolver.resolve(name)?);
        }
    }
    if !resolved.is_empty() {
        replace_tokens(payload, &resolved);
    }
    Ok(())
}

fn contains_token(value: &Value, name: &str) -> bool {
    let token = secret_token(name);
    match value {
        Value::String(s) => s.contains(&token),
        Value::Array(items) => items.iter().any(|v| contains_token(v, name)),
        Value::Object(map) => map.values().any(|v| contains_token(v, name)),
        _ => false,
    }
}

fn replace_tokens(value: &mut Value, resolved: &BTreeMap<&str, SecretString>) {
    match value {
        Value::String(s) => {
            if s.contains(TOKEN_PREFIX) {
                for (name, secret) in resolved {
                    *s = s.replace(&secret_token(name), secret.expose_secret());
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| replace_tokens(v, resolved)),
        Value::Object(map) => map.values_mut().for_each(|v| replace_tokens(v, resolved)),
        _ => {}
    }
}

/// Replace any secret values that leaked into adapter output with tokens.
pub fn redact_output(value: &mut Value, allowed: &[String], resolver: &dyn SecretResolver) {
    for name in allowed {
        let Ok(secret) = resolver.resolve(name) else {
            continue;
        };
        let raw = secret.expose_secret();
        if raw.is_empty() {
            continue;
        }
        redact(value, raw, &secret_token(name));
    }
}

fn redact(value: &mut Value, raw: &str, token: &str) {
    match value {
        Value::String(s) if s.contains(raw) => *s = s.replace(raw, token),
        Value::Array(items) => items.iter_mut().for_each(|v| redact(v, raw, token)),
        Value::Object(map) => map.values_mut().for_each(|v| redact(v, raw, token)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitutes_only_declared_secrets() {
        let secrets = StaticSecrets::new().with("TOKEN", "s3cr3t").with("OTHER", "nope");
        let mut payload = json!({
            "headers": {"Authorization": "Bearer <<secret:TOKEN>>"},
            "body": "<<secret:OTHER>>",
        });
        substitute_secrets(&mut payload, &["TOKEN".to_string()], &secrets).unwrap();
        assert_eq!(payload["headers"]["Authorization"], "Bearer s3cr3t");
        assert_eq!(payload["body"], "<<secret:OTHER>>");
    }

    #[test]
    fn test_missing_secret_is_not_found() {
        let mut payload = json!("<<secret:TOKEN>>");
        let err = substitute_secrets(&mut payload, &["TOKEN".to_string()], &StaticSecrets::new())
            .unwrap_err();
        assert!(matches!(err, SecretError::NotFound(name) if name == "TOKEN"));
    }

    #[test]
    fn test_unused_secret_is_not_resolved() {
        let mut payload = json!({"run": "echo hi"});
        substitute_secrets(&mut payload, &["TOKEN".to_string()], &StaticSecrets::new()).unwrap();
    }

    #[test]
    fn test_redact_output() {
        let secrets = StaticSecrets::new().with("TOKEN", "s3cr3t");
        let mut out = json!({"stdout": "token=s3cr3t\n"});
        redact_output(&mut out, &["TOKEN".to_string()], &secrets);
        assert_eq!(out["stdout"], "token=<<secret:TOKEN>>\n");
    }
}
