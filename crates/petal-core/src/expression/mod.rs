//! Expression compiler: lexer, parser and evaluator for Petal's micro-grammar.
//!
//! Three dialects share one grammar:
//! - `Condition` -- `if:` clauses. Boolean and comparison operators only;
//!   identifiers must live under `params`, `vars`, `outputs` or `env`, and
//!   `secrets.NAME` is an existence check.
//! - `Template` -- the inside of `{{ ... }}`. Adds bare identifiers (resolved
//!   by priority), `inputs.*`, helper calls and `|` filters.
//! - `Interpreter` -- the eval adapter. Adds arithmetic; every identifier is a
//!   binding. No assignment or definitions exist in the grammar at all.
//!
//! Parsing happens once; evaluation is side-effect-free.

mod eval;
mod functions;
mod lexer;
mod parser;

use petal_types::expr::{Expr, Reference};

pub use eval::{Resolver, evaluate, evaluate_condition, lookup_path, truthy};
pub use functions::{INTERPRETER_FUNCTIONS, TEMPLATE_FUNCTIONS, call_builtin};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error at column {column}: {message}")]
    Syntax { column: usize, message: String },

    #[error("undefined reference '{0}'")]
    UndefinedReference(String),

    #[error("not allowed here: {0}")]
    ScopeNotAllowed(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Condition,
    Template,
    Interpreter,
}

impl Dialect {
    fn allows_arithmetic(&self) -> bool {
        matches!(self, Dialect::Interpreter)
    }

    fn allows_calls(&self) -> bool {
        !matches!(self, Dialect::Condition)
    }

    fn describe(&self) -> &'static str {
        match self {
            Dialect::Condition => "conditions",
            Dialect::Template => "templates",
            Dialect::Interpreter => "eval expressions",
        }
    }

    fn functions(&self) -> &'static [&'static str] {
        match self {
            Dialect::Condition => &[],
            Dialect::Template => TEMPLATE_FUNCTIONS,
            Dialect::Interpreter => INTERPRETER_FUNCTIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse an expression in the given dialect.
pub fn parse(source: &str, dialect: Dialect) -> Result<Expr, ExpressionError> {
    let tokens = lexer::tokenize(source, dialect)?;
    let expr = parser::Parser::new(tokens, dialect).parse_all()?;
    check_functions(&expr, dialect)?;
    Ok(expr)
}

/// Parse the inside of a `{{ ... }}` block, including `|` filters.
pub fn parse_template_expr(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = lexer::tokenize(source, Dialect::Template)?;
    let expr = parser::Parser::new(tokens, Dialect::Template).parse_pipeline()?;
    check_functions(&expr, Dialect::Template)?;
    Ok(expr)
}

/// Parse a bare reference such as `outputs.fetch.path` (used by `inputs.from`).
pub fn parse_reference(source: &str) -> Result<Reference, ExpressionError> {
    match parse(source, Dialect::Condition)? {
        Expr::Ref { reference } => Ok(reference),
        _ => Err(ExpressionError::Syntax {
            column: 1,
            message: format!("'{source}' is not a reference"),
        }),
    }
}

fn check_functions(expr: &Expr, dialect: Dialect) -> Result<(), ExpressionError> {
    let allowed = dialect.functions();
    match expr.calls().into_iter().find(|f| !allowed.contains(f)) {
        Some(unknown) => Err(ExpressionError::UnknownFunction(unknown.to_string())),
        None => Ok(()),
    }
}
