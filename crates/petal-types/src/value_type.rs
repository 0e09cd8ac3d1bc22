//! The closed set of value type tags used by parameters, inputs and outputs.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type tag for a parameter, input or output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    String,
    Int,
    Float,
    Bool,
    Path,
    File,
    Dir,
    Json,
    Secret,
    Bytes,
}

impl TypeTag {
    pub const ALL: [TypeTag; 10] = [
        TypeTag::String,
        TypeTag::Int,
        TypeTag::Float,
        TypeTag::Bool,
        TypeTag::Path,
        TypeTag::File,
        TypeTag::Dir,
        TypeTag::Json,
        TypeTag::Secret,
        TypeTag::Bytes,
    ];

    /// Look up a tag by its document spelling.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::String => "string",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Bool => "bool",
            TypeTag::Path => "path",
            TypeTag::File => "file",
            TypeTag::Dir => "dir",
            TypeTag::Json => "json",
            TypeTag::Secret => "secret",
            TypeTag::Bytes => "bytes",
        }
    }

    /// Check the shape of a value against this tag.
    ///
    /// Does not touch the filesystem: `file` and `dir` only require a string
    /// here. Use [`TypeTag::check_on_disk`] at dispatch time.
    pub fn check(&self, value: &Value) -> bool {
        match self {
            TypeTag::String | TypeTag::Path | TypeTag::File | TypeTag::Dir | TypeTag::Secret => {
                value.is_string()
            }
            TypeTag::Int => value.is_i64() || value.is_u64(),
            TypeTag::Float => value.is_number(),
            TypeTag::Bool => value.is_boolean(),
            TypeTag::Json => true,
            TypeTag::Bytes => {
                value.is_string()
                    || value
                        .as_array()
                        .is_some_and(|items| items.iter().all(|b| b.as_u64().is_some_and(|n| n <= 255)))
            }
        }
    }

    /// Shape check plus existence checks for `file` and `dir`.
    pub fn check_on_disk(&self, value: &Value) -> bool {
        if !self.check(value) {
            return false;
        }
        match (self, value.as_str()) {
            (TypeTag::File, Some(p)) => Path::new(p).is_file(),
            (TypeTag::Dir, Some(p)) => Path::new(p).is_dir(),
            _ => true,
        }
    }

    /// Coerce a flat command-line string into a typed value.
    pub fn coerce(&self, raw: &str) -> Result<Value, String> {
        match self {
            TypeTag::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{raw}' is not an int")),
            TypeTag::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{raw}' is not a float")),
            TypeTag::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("'{raw}' is not a bool")),
            },
            TypeTag::Json => serde_json::from_str(raw).map_err(|e| format!("invalid json: {e}")),
            _ => Ok(Value::String(raw.to_string())),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_closed_set() {
        for tag in TypeTag::ALL {
            assert_eq!(TypeTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(TypeTag::parse("integer"), None);
    }

    #[test]
    fn test_check_shapes() {
        assert!(TypeTag::Int.check(&json!(3)));
        assert!(!TypeTag::Int.check(&json!(3.5)));
        assert!(TypeTag::Float.check(&json!(3)));
        assert!(TypeTag::Bool.check(&json!(false)));
        assert!(TypeTag::Json.check(&json!({"a": [1]})));
        assert!(TypeTag::Bytes.check(&json!([0, 255])));
        assert!(!TypeTag::Bytes.check(&json!([256])));
        assert!(!TypeTag::String.check(&json!(null)));
    }

    #[test]
    fn test_check_on_disk() {
        let dir = std::env::temp_dir();
        let value = json!(dir.to_string_lossy());
        assert!(TypeTag::Dir.check_on_disk(&value));
        assert!(!TypeTag::File.check_on_disk(&value));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(TypeTag::Int.coerce("42").unwrap(), json!(42));
        assert_eq!(TypeTag::Bool.coerce("yes").unwrap(), json!(true));
        assert_eq!(TypeTag::Json.coerce("[1,2]").unwrap(), json!([1, 2]));
        assert_eq!(TypeTag::Path.coerce("a/b").unwrap(), json!("a/b"));
        assert!(TypeTag::Float.coerce("fast").is_err());
    }
}
