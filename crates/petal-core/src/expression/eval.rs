//! Tree-walking evaluator over `serde_json::Value`.

use std::cmp::Ordering;

use petal_types::expr::{BinaryOp, Expr, Reference, UnaryOp};
use serde_json::{Number, Value};

use super::ExpressionError;
use super::functions::call_builtin;

/// Supplies reference values (and optionally extra helper functions).
pub trait Resolver {
    /// Resolve a reference.
    ///
    /// Return `Ok(Value::Null)` for things that are legitimately absent (for
    /// example outputs of a skipped step) and `Err(UndefinedReference)` for
    /// names that do not exist at all.
    fn lookup(&self, reference: &Reference) -> Result<Value, ExpressionError>;

    /// Call a helper function. The default covers the pure built-ins.
    fn call(&self, function: &str, args: &[Value]) -> Result<Value, ExpressionError> {
        call_builtin(function, args)
    }
}

/// Walk a dotted path into a JSON value. Numeric segments index arrays.
pub fn lookup_path<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, seg| match current {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate an expression tree.
pub fn evaluate(expr: &Expr, resolver: &dyn Resolver) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Ref { reference } => resolver.lookup(reference),
        Expr::List { items } => Ok(Value::Array(
            items
                .iter()
                .map(|e| evaluate(e, resolver))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Call { function, args } => {
            let args: Vec<Value> = args
                .iter()
                .map(|e| evaluate(e, resolver))
                .collect::<Result<_, _>>()?;
            resolver.call(function, &args)
        }
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, resolver)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => match &value {
                    Value::Number(n) => Ok(match n.as_i64().and_then(i64::checked_neg) {
                        Some(i) => Value::from(i),
                        None => float(-n.as_f64().unwrap_or_default()),
                    }),
                    other => Err(ExpressionError::Type(format!("cannot negate {}", type_name(other)))),
                },
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                let l = evaluate(left, resolver)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&evaluate(right, resolver)?)))
            }
            BinaryOp::Or => {
                let l = evaluate(left, resolver)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&evaluate(right, resolver)?)))
            }
            _ => {
                let l = evaluate(left, resolver)?;
                let r = evaluate(right, resolver)?;
                binary(*op, &l, &r)
            }
        },
    }
}

/// Evaluate and reduce to a boolean with truthiness.
pub fn evaluate_condition(expr: &Expr, resolver: &dyn Resolver) -> Result<bool, ExpressionError> {
    Ok(truthy(&evaluate(expr, resolver)?))
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            // Comparisons against an absent value are false rather than errors,
            // so conditions over optional outputs stay well-defined.
            if l.is_null() || r.is_null() {
                return Ok(Value::Bool(false));
            }
            let ord = compare(l, r).ok_or_else(|| {
                ExpressionError::Type(format!(
                    "cannot compare {} with {} using '{}'",
                    type_name(l),
                    type_name(r),
                    op.symbol()
                ))
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::In => contains(r, l).map(Value::Bool),
        BinaryOp::Add => add(l, r),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, l, r),
        BinaryOp::And => Ok(Value::Bool(truthy(l) && truthy(r))),
        BinaryOp::Or => Ok(Value::Bool(truthy(l) || truthy(r))),
    }
}

/// Structural equality, with `1 == 1.0`.
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExpressionError> {
    match (haystack, needle) {
        (Value::Null, _) => Ok(false),
        (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(ExpressionError::Type(format!(
            "'in' needs a list, string or object on the right, got {}",
            type_name(haystack)
        ))),
    }
}

fn add(l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
        (Value::Number(_), Value::Number(_)) => arithmetic(BinaryOp::Add, l, r),
        _ => Err(ExpressionError::Type(format!(
            "cannot add {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    let (Value::Number(a), Value::Number(b)) = (l, r) else {
        return Err(ExpressionError::Type(format!(
            "'{}' needs numbers, got {} and {}",
            op.symbol(),
            type_name(l),
            type_name(r)
        )));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Rem => {
                if y == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                x.checked_rem(y)
            }
            BinaryOp::Div => {
                if y == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                if x.checked_rem(y) == Some(0) { x.checked_div(y) } else { None }
            }
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => x / y,
        _ => x % y,
    };
    Ok(float(result))
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
