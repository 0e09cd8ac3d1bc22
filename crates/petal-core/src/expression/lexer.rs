//! Tokenizer shared by all expression dialects.

use super::{Dialect, ExpressionError};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pipe,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    /// 1-based column of the first character.
    pub col: usize,
}

fn syntax(col: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        column: col,
        message: message.into(),
    }
}

/// Split `source` into tokens.
///
/// Step ids may contain `-` and `#` (implicit ids look like `shell#2`), so
/// those characters are identifier characters everywhere except in the
/// interpreter dialect, where `-` is subtraction.
pub(crate) fn tokenize(source: &str, dialect: Dialect) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let col = i + 1;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i], dialect) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let tok = match word.as_str() {
                "true" => Tok::True,
                "false" => Tok::False,
                "null" => Tok::Null,
                "in" => Tok::In,
                _ => Tok::Ident(word),
            };
            tokens.push(Token { tok, col });
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let tok = if is_float {
                Tok::Float(text.parse().map_err(|_| syntax(col, format!("bad number '{text}'")))?)
            } else {
                Tok::Int(
                    text.parse()
                        .map_err(|_| syntax(col, format!("integer '{text}' out of range")))?,
                )
            };
            tokens.push(Token { tok, col });
            continue;
        }

        if c == '\'' || c == '"' {
            let (text, next) = read_string(&chars, i)?;
            tokens.push(Token {
                tok: Tok::Str(text),
                col,
            });
            i = next;
            continue;
        }

        let two: Option<char> = chars.get(i + 1).copied();
        let (tok, width) = match (c, two) {
            ('&', Some('&')) => (Tok::And, 2),
            ('|', Some('|')) => (Tok::Or, 2),
            ('=', Some('=')) => (Tok::Eq, 2),
            ('!', Some('=')) => (Tok::Ne, 2),
            ('<', Some('=')) => (Tok::Le, 2),
            ('>', Some('=')) => (Tok::Ge, 2),
            ('<', _) => (Tok::Lt, 1),
            ('>', _) => (Tok::Gt, 1),
            ('!', _) => (Tok::Not, 1),
            ('|', _) => (Tok::Pipe, 1),
            ('(', _) => (Tok::LParen, 1),
            (')', _) => (Tok::RParen, 1),
            ('[', _) => (Tok::LBracket, 1),
            (']', _) => (Tok::RBracket, 1),
            (',', _) => (Tok::Comma, 1),
            ('.', _) => (Tok::Dot, 1),
            ('+', _) => (Tok::Plus, 1),
            ('-', _) => (Tok::Minus, 1),
            ('*', _) => (Tok::Star, 1),
            ('/', _) => (Tok::Slash, 1),
            ('%', _) => (Tok::Percent, 1),
            ('=', _) => return Err(syntax(col, "assignment is not supported, use '=='")),
            _ => return Err(syntax(col, format!("unexpected character '{c}'"))),
        };
        tokens.push(Token { tok, col });
        i += width;
    }

    tokens.push(Token {
        tok: Tok::Eof,
        col: chars.len() + 1,
    });
    Ok(tokens)
}

fn is_ident_char(c: char, dialect: Dialect) -> bool {
    c.is_ascii_alphanumeric()
        || c == '_'
        || c == '#'
        || (c == '-' && dialect != Dialect::Interpreter)
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize), ExpressionError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| syntax(i + 1, "unterminated escape"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(syntax(start + 1, "unterminated string literal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str, dialect: Dialect) -> Vec<Tok> {
        tokenize(src, dialect).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_operators_and_literals() {
        let toks = kinds("a >= 1.5 && b != 'x' || !c", Dialect::Condition);
        assert_eq!(
            toks,
            vec![
                Tok::Ident("a".into()),
                Tok::Ge,
                Tok::Float(1.5),
                Tok::And,
                Tok::Ident("b".into()),
                Tok::Ne,
                Tok::Str("x".into()),
                Tok::Or,
                Tok::Not,
                Tok::Ident("c".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_step_ids_with_hash_and_dash() {
        let toks = kinds("outputs.shell#1.fetch-data", Dialect::Condition);
        assert_eq!(toks[2], Tok::Ident("shell#1".into()));
        assert_eq!(toks[4], Tok::Ident("fetch-data".into()));

        let toks = kinds("a-b", Dialect::Interpreter);
        assert_eq!(toks[1], Tok::Minus);
    }

    #[test]
    fn test_string_escapes() {
        let toks = kinds(r#""say \"hi\"\n""#, Dialect::Condition);
        assert_eq!(toks[0], Tok::Str("say \"hi\"\n".into()));
    }

    #[test]
    fn test_errors_carry_column() {
        let err = tokenize("a = 1", Dialect::Condition).unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { column: 3, .. }));
        assert!(tokenize("'open", Dialect::Condition).is_err());
        assert!(tokenize("a ; b", Dialect::Condition).is_err());
    }
}
