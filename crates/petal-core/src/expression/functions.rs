//! Pure helper functions callable from templates and the eval adapter.

use std::path::{Path, PathBuf};

use chrono::Utc;
use chrono::format::{Item, StrftimeItems};
use serde_json::{Number, Value};

use super::ExpressionError;
use super::eval::type_name;

/// Helpers (and `|` filters) available inside `{{ ... }}`.
pub const TEMPLATE_FUNCTIONS: &[&str] = &[
    "truncate", "length", "tojson", "now", "joinpath", "basename", "dirname", "lower", "upper",
    "trim", "default",
];

/// Helpers available to the eval adapter.
pub const INTERPRETER_FUNCTIONS: &[&str] =
    &["length", "min", "max", "abs", "round", "lower", "upper", "trim"];

/// Dispatch a built-in helper by name.
pub fn call_builtin(function: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match function {
        "length" => {
            let [v] = arity::<1>(function, args)?;
            let n = match v {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(bad_arg(function, other)),
            };
            Ok(Value::from(n as u64))
        }
        "truncate" => {
            let [v, n] = arity::<2>(function, args)?;
            let s = as_str(function, v)?;
            let n = n.as_u64().ok_or_else(|| bad_arg(function, n))? as usize;
            Ok(Value::String(s.chars().take(n).collect()))
        }
        "tojson" => {
            let [v] = arity::<1>(function, args)?;
            serde_json::to_string(v)
                .map(Value::String)
                .map_err(|e| ExpressionError::Type(e.to_string()))
        }
        "now" => now(args),
        "joinpath" => {
            if args.is_empty() {
                return Err(ExpressionError::Type("joinpath needs at least one argument".into()));
            }
            let mut path = PathBuf::new();
            for arg in args {
                path.push(as_str(function, arg)?);
            }
            Ok(Value::String(path.to_string_lossy().into_owned()))
        }
        "basename" => {
            let [v] = arity::<1>(function, args)?;
            let name = Path::new(as_str(function, v)?)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(Value::String(name))
        }
        "dirname" => {
            let [v] = arity::<1>(function, args)?;
            let parent = Path::new(as_str(function, v)?)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(Value::String(parent))
        }
        "lower" => {
            let [v] = arity::<1>(function, args)?;
            Ok(Value::String(as_str(function, v)?.to_lowercase()))
        }
        "upper" => {
            let [v] = arity::<1>(function, args)?;
            Ok(Value::String(as_str(function, v)?.to_uppercase()))
        }
        "trim" => {
            let [v] = arity::<1>(function, args)?;
            Ok(Value::String(as_str(function, v)?.trim().to_string()))
        }
        "default" => {
            let [v, fallback] = arity::<2>(function, args)?;
            Ok(if v.is_null() { fallback.clone() } else { v.clone() })
        }
        "min" | "max" => {
            let values: Vec<&Value> = match args {
                [Value::Array(items)] => items.iter().collect(),
                _ => args.iter().collect(),
            };
            let mut best: Option<&Value> = None;
            for v in values {
                let x = v.as_f64().ok_or_else(|| bad_arg(function, v))?;
                let replace = match best.and_then(Value::as_f64) {
                    None => true,
                    Some(b) if function == "min" => x < b,
                    Some(b) => x > b,
                };
                if replace {
                    best = Some(v);
                }
            }
            best.cloned()
                .ok_or_else(|| ExpressionError::Type(format!("{function} of an empty list")))
        }
        "abs" => {
            let [v] = arity::<1>(function, args)?;
            match v.as_i64() {
                Some(i) => Ok(Value::from(i.abs())),
                None => float(v.as_f64().ok_or_else(|| bad_arg(function, v))?.abs()),
            }
        }
        "round" => {
            let (v, digits) = match args {
                [v] => (v, 0),
                [v, d] => (v, d.as_i64().ok_or_else(|| bad_arg(function, d))?),
                _ => return Err(wrong_arity(function, 1, args.len())),
            };
            if v.is_i64() {
                return Ok(v.clone());
            }
            let x = v.as_f64().ok_or_else(|| bad_arg(function, v))?;
            if digits <= 0 {
                return Ok(Value::from(x.round() as i64));
            }
            let scale = 10f64.powi(digits as i32);
            float((x * scale).round() / scale)
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

/// `now()` is RFC 3339 UTC; `now(fmt)` takes a strftime pattern.
fn now(args: &[Value]) -> Result<Value, ExpressionError> {
    let now = Utc::now();
    match args {
        [] => Ok(Value::String(now.to_rfc3339())),
        [Value::String(fmt)] => {
            let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
            if items.iter().any(|i| matches!(i, Item::Error)) {
                return Err(ExpressionError::Type(format!("invalid time format '{fmt}'")));
            }
            Ok(Value::String(
                now.format_with_items(items.into_iter()).to_string(),
            ))
        }
        [other] => Err(bad_arg("now", other)),
        _ => Err(wrong_arity("now", 1, args.len())),
    }
}

fn arity<'a, const N: usize>(
    function: &str,
    args: &'a [Value],
) -> Result<&'a [Value; N], ExpressionError> {
    args.try_into().map_err(|_| wrong_arity(function, N, args.len()))
}

fn wrong_arity(function: &str, expected: usize, got: usize) -> ExpressionError {
    ExpressionError::Type(format!("{function} expects {expected} argument(s), got {got}"))
}

fn bad_arg(function: &str, value: &Value) -> ExpressionError {
    ExpressionError::Type(format!("{function} does not accept {}", type_name(value)))
}

fn as_str<'a>(function: &str, value: &'a Value) -> Result<&'a str, ExpressionError> {
    value.as_str().ok_or_else(|| bad_arg(function, value))
}

fn float(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type("result is not a finite number".into()))
}
