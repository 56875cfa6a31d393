//! A small s-expression reader for writing programs as text.
//!
//! Numbers read as [`Value::Number`], `#t`/`#f` and `true`/`false` as
//! booleans, `'x` as `(quote x)` and everything else as symbols. `;`
//! starts a comment that runs to the end of the line.

use std::{iter::Peekable, str::CharIndices};

use crate::{
    error::{Result, TraceError},
    value::Value,
};

fn malformed(message: impl Into<String>) -> TraceError {
    TraceError::MalformedExpression {
        message: message.into(),
    }
}

/// Read exactly one expression.
pub fn read(text: &str) -> Result<Value> {
    let mut values = read_all(text)?;
    match values.len() {
        1 => Ok(values.remove(0)),
        0 => Err(malformed("no expression")),
        n => Err(malformed(format!("expected one expression, found {}", n))),
    }
}

/// Read every expression in `text`.
pub fn read_all(text: &str) -> Result<Vec<Value>> {
    let mut reader = Reader {
        text,
        chars: text.char_indices().peekable(),
    };
    let mut values = Vec::new();
    while reader.skip_space() {
        values.push(reader.expression()?);
    }
    Ok(values)
}

struct Reader<'a> {
    text: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Reader<'_> {
    /// Skip whitespace and comments. Returns whether input remains.
    fn skip_space(&mut self) -> bool {
        while let Some(&(_, c)) = self.chars.peek() {
            if c == ';' {
                while let Some((_, c)) = self.chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c.is_whitespace() {
                self.chars.next();
            } else {
                return true;
            }
        }
        false
    }

    fn expression(&mut self) -> Result<Value> {
        let Some(&(start, c)) = self.chars.peek() else {
            return Err(malformed("unexpected end of input"));
        };
        match c {
            '(' => {
                self.chars.next();
                let mut items = Vec::new();
                loop {
                    if !self.skip_space() {
                        return Err(malformed("unclosed parenthesis"));
                    }
                    if let Some(&(_, ')')) = self.chars.peek() {
                        self.chars.next();
                        return Ok(Value::list(items));
                    }
                    items.push(self.expression()?);
                }
            }
            ')' => Err(malformed(format!("unexpected `)` at offset {}", start))),
            '\'' => {
                self.chars.next();
                if !self.skip_space() {
                    return Err(malformed("nothing to quote"));
                }
                let quoted = self.expression()?;
                Ok(Value::list(vec![Value::symbol("quote"), quoted]))
            }
            _ => Ok(self.atom(start)),
        }
    }

    fn atom(&mut self, start: usize) -> Value {
        let mut end = self.text.len();
        while let Some(&(index, c)) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '\'' | ';') {
                end = index;
                break;
            }
            self.chars.next();
        }
        let token = &self.text[start..end];
        match token {
            "#t" | "true" => return Value::Bool(true),
            "#f" | "false" => return Value::Bool(false),
            _ => {}
        }
        if looks_numeric(token) {
            if let Ok(x) = token.parse::<f64>() {
                return Value::Number(x);
            }
        }
        Value::symbol(token)
    }
}

/// Keeps symbols such as `-`, `inf` or `nan` out of number parsing.
fn looks_numeric(token: &str) -> bool {
    let digits = token.trim_start_matches(['+', '-']).trim_start_matches('.');
    digits.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_nested_lists() -> Result<()> {
        let exp = read("(normal (+ mu 1) 0.5)")?;
        assert_eq!(
            exp,
            Value::list(vec![
                Value::symbol("normal"),
                Value::list(vec![Value::symbol("+"), Value::symbol("mu"), Value::Number(1.)]),
                Value::Number(0.5),
            ])
        );
        assert_eq!(exp.to_string(), "(normal (+ mu 1) 0.5)");
        Ok(())
    }

    #[test]
    fn reads_atoms() -> Result<()> {
        assert_eq!(read("-")?, Value::symbol("-"));
        assert_eq!(read("-2.5")?, Value::Number(-2.5));
        assert_eq!(read(".5")?, Value::Number(0.5));
        assert_eq!(read("1e3")?, Value::Number(1000.));
        assert_eq!(read("inf")?, Value::symbol("inf"));
        assert_eq!(read("#t")?, Value::Bool(true));
        assert_eq!(read("false")?, Value::Bool(false));
        assert_eq!(read("()")?, Value::Nil);
        Ok(())
    }

    #[test]
    fn quotes_and_comments() -> Result<()> {
        let exp = read("; a comment\n'(a b) ; trailing")?;
        assert_eq!(
            exp,
            Value::list(vec![
                Value::symbol("quote"),
                Value::list(vec![Value::symbol("a"), Value::symbol("b")]),
            ])
        );
        assert_eq!(read_all("1 2 (x)")?.len(), 3);
        Ok(())
    }

    #[test]
    fn rejects_unbalanced_input() {
        assert!(read("(a b").is_err());
        assert!(read(")").is_err());
        assert!(read("").is_err());
        assert!(read("a b").is_err());
        assert!(read("'").is_err());
    }
}
