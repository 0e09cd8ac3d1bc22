//! Compiled expression tree for `if:` conditions and the eval adapter.
//!
//! The tree is built once at compile time, stored in the lock artifact and
//! evaluated by the engine immediately before a step would run.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace a reference resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Params,
    Vars,
    Outputs,
    Env,
    /// Existence checks only; evaluates to a bool.
    Secrets,
    /// A step's own resolved inputs.
    Inputs,
    /// Interpreter bindings (eval adapter only).
    Local,
}

impl Scope {
    pub fn from_prefix(name: &str) -> Option<Self> {
        match name {
            "params" => Some(Scope::Params),
            "vars" => Some(Scope::Vars),
            "outputs" => Some(Scope::Outputs),
            "env" => Some(Scope::Env),
            "secrets" => Some(Scope::Secrets),
            "inputs" => Some(Scope::Inputs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Params => "params",
            Scope::Vars => "vars",
            Scope::Outputs => "outputs",
            Scope::Env => "env",
            Scope::Secrets => "secrets",
            Scope::Inputs => "inputs",
            Scope::Local => "local",
        }
    }
}

/// A dotted lookup such as `outputs.build.artifact`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub scope: Scope,
    pub path: Vec<String>,
}

impl Reference {
    pub fn new(scope: Scope, path: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            scope,
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// First path segment (the step id for `outputs.*`).
    pub fn head(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope != Scope::Local {
            f.write_str(self.scope.as_str())?;
        }
        for (i, seg) in self.path.iter().enumerate() {
            let plain = seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '#'));
            if !plain {
                write!(f, "[{}]", Value::String(seg.clone()))?;
            } else if i == 0 && self.scope == Scope::Local {
                f.write_str(seg)?;
            } else {
                write!(f, ".{seg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Value,
    },
    Ref {
        reference: Reference,
    },
    List {
        items: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Helper function call (templates and the eval adapter only).
    Call {
        function: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Every reference in the tree, in source order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Ref { reference } => out.push(reference),
            Expr::List { items } | Expr::Call { args: items, .. } => {
                items.iter().for_each(|e| e.collect_refs(out))
            }
            Expr::Unary { operand, .. } => operand.collect_refs(out),
            Expr::Binary { left, right, .. } => {
                left.collect_refs(out);
                right.collect_refs(out);
            }
        }
    }

    /// Names of every helper function called in the tree.
    pub fn calls(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_calls(&mut out);
        out
    }

    fn collect_calls<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal { .. } | Expr::Ref { .. } => {}
            Expr::List { items } => items.iter().for_each(|e| e.collect_calls(out)),
            Expr::Call { function, args } => {
                out.push(function.as_str());
                args.iter().for_each(|e| e.collect_calls(out));
            }
            Expr::Unary { operand, .. } => operand.collect_calls(out),
            Expr::Binary { left, right, .. } => {
                left.collect_calls(out);
                right.collect_calls(out);
            }
        }
    }

    /// Rewrite references in place (used to apply macro alias tables).
    pub fn map_refs(&mut self, f: &mut impl FnMut(&mut Reference)) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Ref { reference } => f(reference),
            Expr::List { items } | Expr::Call { args: items, .. } => {
                items.iter_mut().for_each(|e| e.map_refs(f))
            }
            Expr::Unary { operand, .. } => operand.map_refs(f),
            Expr::Binary { left, right, .. } => {
                left.map_refs(f);
                right.map_refs(f);
            }
        }
    }
}
