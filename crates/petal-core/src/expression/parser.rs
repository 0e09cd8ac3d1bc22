//! Recursive-descent parser producing [`Expr`] trees.
//!
//! Precedence, lowest first: `||`, `&&`, comparisons (`== != < <= > >= in`,
//! non-associative), `+ -`, `* / %`, unary `! -`, then postfix member access.

use petal_types::expr::{BinaryOp, Expr, Reference, Scope, UnaryOp};
use serde_json::Value;

use super::lexer::{Tok, Token};
use super::{Dialect, ExpressionError};

/// Nesting limit for parenthesized or unary chains.
const MAX_DEPTH: usize = 64;

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    dialect: Dialect,
    depth: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>, dialect: Dialect) -> Self {
        Self {
            tokens,
            pos: 0,
            dialect,
            depth: 0,
        }
    }

    pub(crate) fn parse_all(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.parse_or()?;
        self.expect_eof()?;
        Ok(expr)
    }

    /// Parse a template head followed by `| filter(args)` segments.
    ///
    /// Filters are rewritten into calls with the piped value as the first
    /// argument, so `x | truncate(5)` is `truncate(x, 5)`.
    pub(crate) fn parse_pipeline(mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_or()?;
        while self.peek() == &Tok::Pipe {
            self.advance();
            let col = self.col();
            let name = match self.advance().tok {
                Tok::Ident(name) => name,
                _ => return Err(self.error_at(col, "expected a filter name after '|'")),
            };
            let mut args = vec![expr];
            if self.peek() == &Tok::LParen {
                self.advance();
                args.extend(self.parse_args()?);
            }
            expr = Expr::Call {
                function: name,
                args,
            };
        }
        self.expect_eof()?;
        Ok(expr)
    }

    // -----------------------------------------------------------------------
    // Token helpers
    // -----------------------------------------------------------------------

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn col(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].col
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, column: usize, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            column,
            message: message.into(),
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ExpressionError> {
        if self.peek() == &tok {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at(self.col(), format!("expected {what}")))
        }
    }

    fn expect_eof(&mut self) -> Result<(), ExpressionError> {
        if self.peek() == &Tok::Eof {
            Ok(())
        } else {
            Err(self.error_at(self.col(), format!("unexpected {}", describe(self.peek()))))
        }
    }

    // -----------------------------------------------------------------------
    // Grammar
    // -----------------------------------------------------------------------

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == &Tok::Or {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == &Tok::And {
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Tok::Eq => BinaryOp::Eq,
            Tok::Ne => BinaryOp::Ne,
            Tok::Lt => BinaryOp::Lt,
            Tok::Le => BinaryOp::Le,
            Tok::Gt => BinaryOp::Gt,
            Tok::Ge => BinaryOp::Ge,
            Tok::In => BinaryOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        if matches!(
            self.peek(),
            Tok::Eq | Tok::Ne | Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge | Tok::In
        ) {
            return Err(self.error_at(
                self.col(),
                "comparisons cannot be chained, use '&&'",
            ));
        }
        Ok(binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.check_arithmetic()?;
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.check_arithmetic()?;
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn check_arithmetic(&self) -> Result<(), ExpressionError> {
        if self.dialect.allows_arithmetic() {
            Ok(())
        } else {
            Err(self.error_at(
                self.col(),
                format!("arithmetic is not allowed in {}", self.dialect.describe()),
            ))
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            Tok::Not => UnaryOp::Not,
            Tok::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary()?;
        self.depth -= 1;

        // Fold negative literals so `-1` stays a literal in the tree.
        if op == UnaryOp::Neg {
            if let Expr::Literal { value: Value::Number(n) } = &operand {
                if let Some(i) = n.as_i64().and_then(i64::checked_neg) {
                    return Ok(literal(Value::from(i)));
                }
                if let Some(f) = n.as_f64() {
                    return Ok(literal(Value::from(-f)));
                }
            }
            if !self.dialect.allows_arithmetic() {
                return Err(self.error_at(self.col(), "negation only applies to number literals here"));
            }
        }
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            Err(self.error_at(self.col(), "expression nested too deeply"))
        } else {
            Ok(())
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let col = self.col();
        let token = self.advance();
        match token.tok {
            Tok::Int(i) => Ok(literal(Value::from(i))),
            Tok::Float(f) => Ok(literal(Value::from(f))),
            Tok::Str(s) => Ok(literal(Value::String(s))),
            Tok::True => Ok(literal(Value::Bool(true))),
            Tok::False => Ok(literal(Value::Bool(false))),
            Tok::Null => Ok(literal(Value::Null)),
            Tok::LParen => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if self.peek() != &Tok::RBracket {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == &Tok::Comma {
                            self.advance();
                            continue;
                        }
                        break;
                    }
                }
                self.expect(Tok::RBracket, "']'")?;
                Ok(Expr::List { items })
            }
            Tok::Ident(name) => {
                if self.peek() == &Tok::LParen {
                    if !self.dialect.allows_calls() {
                        return Err(self.error_at(
                            col,
                            format!("function calls are not allowed in {}", self.dialect.describe()),
                        ));
                    }
                    self.advance();
                    let args = self.parse_args()?;
                    return Ok(Expr::Call {
                        function: name,
                        args,
                    });
                }
                self.parse_reference(name, col)
            }
            other => Err(self.error_at(col, format!("unexpected {}", describe(&other)))),
        }
    }

    /// Arguments after an opening `(`, through the closing `)`.
    fn parse_args(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.peek() != &Tok::RParen {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == &Tok::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(Tok::RParen, "')'")?;
        Ok(args)
    }

    fn parse_reference(&mut self, head: String, col: usize) -> Result<Expr, ExpressionError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let seg_col = self.col();
                    match self.advance().tok {
                        Tok::Ident(name) => segments.push(name),
                        Tok::Int(i) => segments.push(i.to_string()),
                        // Keywords are valid member names (`outputs.check.null`).
                        Tok::True => segments.push("true".to_string()),
                        Tok::False => segments.push("false".to_string()),
                        Tok::Null => segments.push("null".to_string()),
                        Tok::In => segments.push("in".to_string()),
                        _ => return Err(self.error_at(seg_col, "expected a name after '.'")),
                    }
                }
                Tok::LBracket => {
                    self.advance();
                    let seg_col = self.col();
                    match self.advance().tok {
                        Tok::Str(s) => segments.push(s),
                        Tok::Int(i) if i >= 0 => segments.push(i.to_string()),
                        _ => {
                            return Err(self.error_at(
                                seg_col,
                                "subscripts must be a string or non-negative integer literal",
                            ));
                        }
                    }
                    self.expect(Tok::RBracket, "']'")?;
                }
                _ => break,
            }
        }

        let reference = match (self.dialect, Scope::from_prefix(&head)) {
            (Dialect::Interpreter, _) => {
                let mut path = vec![head];
                path.extend(segments);
                Reference::new(Scope::Local, path)
            }
            (_, Some(scope)) => {
                if segments.is_empty() {
                    return Err(self.error_at(col, format!("'{head}' needs a member, e.g. '{head}.name'")));
                }
                Reference::new(scope, segments)
            }
            (Dialect::Template, None) => {
                let mut path = vec![head];
                path.extend(segments);
                Reference::new(Scope::Local, path)
            }
            (Dialect::Condition, None) => {
                return Err(ExpressionError::ScopeNotAllowed(format!(
                    "'{head}': identifiers must start with params, vars, outputs or env"
                )));
            }
        };

        if self.dialect == Dialect::Condition && reference.scope == Scope::Inputs {
            return Err(ExpressionError::ScopeNotAllowed(reference.to_string()));
        }
        if reference.scope == Scope::Secrets && reference.path.len() != 1 {
            return Err(ExpressionError::ScopeNotAllowed(format!(
                "{reference}: secrets have no members"
            )));
        }

        Ok(Expr::Ref { reference })
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn literal(value: Value) -> Expr {
    Expr::Literal { value }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Eof => "end of expression".to_string(),
        Tok::Ident(name) => format!("identifier '{name}'"),
        Tok::Str(s) => format!("string '{s}'"),
        Tok::Pipe => "'|'".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}
