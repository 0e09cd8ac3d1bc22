//! Human-readable durations (`500ms`, `30s`, `5m`, `1h`, or bare seconds).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A duration as written in documents and `petal.toml`.
///
/// Serializes to a canonical string (`"1500ms"` or `"30s"`) so lock files
/// hash identically no matter how the author spelled the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PetalDuration(pub Duration);

impl PetalDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for PetalDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

/// Parse a duration string.
///
/// Accepts `ms`, `s`, `m` and `h` suffixes, or a bare (possibly fractional)
/// number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let (number, unit_ms) = if let Some(n) = input.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = input.strip_suffix('s') {
        (n, 1_000.0)
    } else if let Some(n) = input.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = input.strip_suffix('h') {
        (n, 3_600_000.0)
    } else {
        (input, 1_000.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{input}', use e.g. '500ms', '30s', '5m'"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("duration '{input}' must be a non-negative number"));
    }

    Ok(Duration::from_millis((value * unit_ms).round() as u64))
}

impl fmt::Display for PetalDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms % 1000 == 0 {
            write!(f, "{}s", ms / 1000)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

impl Serialize for PetalDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PetalDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Float(f64),
            Text(String),
        }

        let duration = match Raw::deserialize(deserializer)? {
            Raw::Int(secs) => Duration::from_secs(secs),
            Raw::Float(secs) => parse_duration(&secs.to_string()).map_err(serde::de::Error::custom)?,
            Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom)?,
        };
        Ok(Self(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_display_is_canonical() {
        assert_eq!(PetalDuration::from_secs(60).to_string(), "60s");
        assert_eq!(PetalDuration::from_millis(1500).to_string(), "1500ms");
    }

    #[test]
    fn test_deserialize_number_or_string() {
        let d: PetalDuration = serde_json::from_str("12").unwrap();
        assert_eq!(d.as_duration(), Duration::from_secs(12));
        let d: PetalDuration = serde_json::from_str("\"200ms\"").unwrap();
        assert_eq!(d.as_duration(), Duration::from_millis(200));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"200ms\"");
    }
}
