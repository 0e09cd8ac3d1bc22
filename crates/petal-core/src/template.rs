//! Single-pass `{{ ... }}` template rendering.
//!
//! A template is split into literal text and expression segments once. The
//! rendered result is plain data: nothing produced by rendering is ever
//! scanned for `{{` again, so values coming from params, outputs or secrets
//! cannot inject new template code.

use petal_types::expr::{Expr, Reference};
use serde_json::Value;

use crate::expression::{self, ExpressionError, Resolver};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated '{{{{' at offset {offset}")]
    Unterminated { offset: usize },

    #[error("nested '{{{{' at offset {offset}; templates are rendered once and cannot nest")]
    Nested { offset: usize },

    #[error("empty expression at offset {offset}")]
    Empty { offset: usize },

    #[error("in '{{{{ {expr} }}}}': {source}")]
    Expression {
        expr: String,
        #[source]
        source: ExpressionError,
    },
}

impl TemplateError {
    /// The unresolvable name, if this is an undefined-reference failure.
    pub fn undefined_reference(&self) -> Option<&str> {
        match self {
            TemplateError::Expression {
                source: ExpressionError::UndefinedReference(name),
                ..
            } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr { source: String, expr: Expr },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let body_start = start + OPEN.len();
            let Some(len) = rest[body_start..].find(CLOSE) else {
                return Err(TemplateError::Unterminated {
                    offset: offset + start,
                });
            };
            let body = &rest[body_start..body_start + len];
            if let Some(nested) = body.find(OPEN) {
                return Err(TemplateError::Nested {
                    offset: offset + body_start + nested,
                });
            }
            let trimmed = body.trim();
            if trimmed.is_empty() {
                return Err(TemplateError::Empty {
                    offset: offset + start,
                });
            }
            let expr = expression::parse_template_expr(trimmed).map_err(|source| {
                TemplateError::Expression {
                    expr: trimmed.to_string(),
                    source,
                }
            })?;
            segments.push(Segment::Expr {
                source: trimmed.to_string(),
                expr,
            });

            let consumed = body_start + len + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments })
    }

    /// True when the string has no `{{ }}` blocks at all.
    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    /// Every reference used by the template's expressions.
    pub fn references(&self) -> Vec<&Reference> {
        self.exprs().flat_map(Expr::references).collect()
    }

    /// Every helper function the template calls.
    pub fn calls(&self) -> Vec<&str> {
        self.exprs().flat_map(Expr::calls).collect()
    }

    fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr { expr, .. } => Some(expr),
            Segment::Text(_) => None,
        })
    }

    /// Render to text.
    pub fn render(&self, ctx: &dyn Resolver) -> Result<String, TemplateError> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr { source, expr } => {
                    let value = eval(source, expr, ctx)?;
                    out.push_str(&to_text(&value));
                }
            }
        }
        Ok(out)
    }

    /// Render, keeping the JSON type when the template is exactly one
    /// `{{ expr }}` block.
    pub fn render_value(&self, ctx: &dyn Resolver) -> Result<Value, TemplateError> {
        match self.segments.as_slice() {
            [Segment::Expr { source, expr }] => eval(source, expr, ctx),
            _ => self.render(ctx).map(Value::String),
        }
    }
}

fn eval(source: &str, expr: &Expr, ctx: &dyn Resolver) -> Result<Value, TemplateError> {
    expression::evaluate(expr, ctx).map_err(|e| TemplateError::Expression {
        expr: source.to_string(),
        source: e,
    })
}

/// Text form of a rendered value. Absent values render empty.
fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a template string in one pass.
pub fn render(template: &str, ctx: &dyn Resolver) -> Result<String, TemplateError> {
    Template::parse(template)?.render(ctx)
}

/// Whether a string contains template syntax at all.
pub fn has_template(s: &str) -> bool {
    s.contains(OPEN)
}

// ---------------------------------------------------------------------------
// JSON tree helpers
// ---------------------------------------------------------------------------

/// Collect `(json_pointer, template)` for every templated string in `value`.
pub fn templated_strings<'a>(value: &'a Value, pointer: &str, out: &mut Vec<(String, &'a str)>) {
    match value {
        Value::String(s) if has_template(s) => out.push((pointer.to_string(), s.as_str())),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                templated_strings(item, &format!("{pointer}/{i}"), out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                templated_strings(item, &format!("{pointer}/{}", escape_pointer(key)), out);
            }
        }
        _ => {}
    }
}

/// Escape one JSON pointer token.
pub fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Render every templated string in `value` in place, except those whose
/// pointer is in `skip`.
pub fn render_tree(
    value: &mut Value,
    ctx: &dyn Resolver,
    skip: &[String],
) -> Result<(), Vec<(String, TemplateError)>> {
    let mut found = Vec::new();
    templated_strings(value, "", &mut found);
    let targets: Vec<(String, String)> = found
        .into_iter()
        .filter(|(p, _)| !skip.contains(p))
        .map(|(p, s)| (p, s.to_string()))
        .collect();

    let mut errors = Vec::new();
    for (pointer, source) in targets {
        let rendered = Template::parse(&source).and_then(|t| t.render_value(ctx));
        match rendered {
            Ok(v) => {
                if let Some(slot) = value.pointer_mut(&pointer) {
                    *slot = v;
                }
            }
            Err(e) => errors.push((pointer, e)),
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
