//! Recursive-descent parser for the template expression mini-language.
//!
//! Grammar (low to high precedence):
//!   pipe       := compare ( "|" compare )*
//!   compare    := additive ( ("==" | "!=" | "<=" | ">=" | "<" | ">") additive )*
//!   additive   := postfix ( ("+" | "-" | "*" | "/") postfix )*
//!   postfix    := primary ( "." ident ( "(" args ")" )? | "[" pipe "]" )*
//!   primary    := literal | "(" pipe ")" | ident ( "(" args ")" )?
//!
//! The `oql:` prefix is handled before parsing: the remainder of the
//! expression is a literal query string.

use serde_json::Value;

use super::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Bare identifier: a context root.
    Ident(String),
    /// Top-level call such as `lookup("KEY")` or `now()`.
    Call { name: String, args: Vec<Expr> },
    /// `.name` — property access or zero-arg function, decided at eval time.
    Property { base: Box<Expr>, name: String },
    /// `.name(args…)` — always a function call.
    Method {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// `[expr]` — array or map index.
    Index { base: Box<Expr>, index: Box<Expr> },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Inline query against the current workspace.
    Oql(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Pipe,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

/// Parse one expression (the text between `{{` and `}}`).
pub fn parse_expression(input: &str) -> Result<Expr, TemplateError> {
    let trimmed = input.trim();
    if let Some(query) = trimmed.strip_prefix("oql:") {
        return Ok(Expr::Oql(query.trim().to_string()));
    }

    let mut parser = Parser::new(trimmed);
    let expr = parser.parse_pipe()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(TemplateError::Parse(format!(
            "unexpected trailing input at position {} in '{}'",
            parser.pos, trimmed
        )));
    }
    Ok(expr)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> Result<(), TemplateError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            other => Err(TemplateError::Parse(format!(
                "expected '{}', found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_pipe(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.parse_compare()?;
        loop {
            self.skip_ws();
            // A single '|'; '||' is not part of the language.
            if self.peek() == Some('|') && self.peek_at(1) != Some('|') {
                self.pos += 1;
                let rhs = self.parse_compare()?;
                lhs = Expr::Binary {
                    op: BinaryOp::Pipe,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                };
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_compare(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.parse_additive()?;
        loop {
            self.skip_ws();
            let op = match (self.peek(), self.peek_at(1)) {
                (Some('='), Some('=')) => Some((BinaryOp::Eq, 2)),
                (Some('!'), Some('=')) => Some((BinaryOp::Ne, 2)),
                (Some('<'), Some('=')) => Some((BinaryOp::Le, 2)),
                (Some('>'), Some('=')) => Some((BinaryOp::Ge, 2)),
                (Some('<'), _) => Some((BinaryOp::Lt, 1)),
                (Some('>'), _) => Some((BinaryOp::Gt, 1)),
                _ => None,
            };
            match op {
                Some((op, width)) => {
                    self.pos += width;
                    let rhs = self.parse_additive()?;
                    lhs = Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                None => break,
            }
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.parse_postfix()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some('+') => Some(BinaryOp::Add),
                Some('-') => Some(BinaryOp::Sub),
                Some('*') => Some(BinaryOp::Mul),
                Some('/') => Some(BinaryOp::Div),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.pos += 1;
                    let rhs = self.parse_postfix()?;
                    lhs = Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                None => break,
            }
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.parse_primary()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    let name = self.parse_ident()?;
                    self.skip_ws();
                    if self.peek() == Some('(') {
                        let args = self.parse_args()?;
                        expr = Expr::Method {
                            base: Box::new(expr),
                            name,
                            args,
                        };
                    } else {
                        expr = Expr::Property {
                            base: Box::new(expr),
                            name,
                        };
                    }
                }
                Some('[') => {
                    self.pos += 1;
                    let index = self.parse_pipe()?;
                    self.eat(']')?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, TemplateError> {
        self.skip_ws();
        match self.peek() {
            None => Err(TemplateError::Parse("empty expression".to_string())),
            Some('"') | Some('\'') => {
                let s = self.parse_string()?;
                Ok(Expr::Literal(Value::String(s)))
            }
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_pipe()?;
                self.eat(')')?;
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() => self.parse_number(false),
            Some('-') if matches!(self.peek_at(1), Some(d) if d.is_ascii_digit()) => {
                self.pos += 1;
                self.parse_number(true)
            }
            Some(c) if c.is_alphabetic() || c == '_' || c == '@' => {
                let name = self.parse_ident()?;
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(Value::Bool(true))),
                    "false" => return Ok(Expr::Literal(Value::Bool(false))),
                    "null" => return Ok(Expr::Literal(Value::Null)),
                    _ => {}
                }
                self.skip_ws();
                if self.peek() == Some('(') {
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(other) => Err(TemplateError::Parse(format!(
                "unexpected character '{}' at position {}",
                other, self.pos
            ))),
        }
    }

    fn parse_ident(&mut self) -> Result<String, TemplateError> {
        self.skip_ws();
        let start = self.pos;
        if matches!(self.peek(), Some(c) if c.is_alphabetic() || c == '_' || c == '@') {
            self.pos += 1;
        } else {
            return Err(TemplateError::Parse(format!(
                "expected identifier at position {}",
                self.pos
            )));
        }
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, TemplateError> {
        self.eat('(')?;
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_pipe()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(')') => break,
                other => {
                    return Err(TemplateError::Parse(format!(
                        "expected ',' or ')' in argument list, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(args)
    }

    fn parse_string(&mut self) -> Result<String, TemplateError> {
        let quote = self.bump().unwrap_or('"');
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(TemplateError::Parse("unterminated string literal".to_string()))
                }
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c) => out.push(c),
                    None => {
                        return Err(TemplateError::Parse(
                            "unterminated escape sequence".to_string(),
                        ))
                    }
                },
                Some(c) if c == quote => break,
                Some(c) => out.push(c),
            }
        }
        Ok(out)
    }

    fn parse_number(&mut self, negative: bool) -> Result<Expr, TemplateError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit()) {
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        // Whole numbers stay integers so indexing and stringification behave.
        if !text.contains('.') {
            let mut number: i64 = text
                .parse()
                .map_err(|_| TemplateError::Parse(format!("invalid number '{}'", text)))?;
            if negative {
                number = -number;
            }
            return Ok(Expr::Literal(Value::from(number)));
        }
        let mut number: f64 = text
            .parse()
            .map_err(|_| TemplateError::Parse(format!("invalid number '{}'", text)))?;
        if negative {
            number = -number;
        }
        let value = serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        Ok(Expr::Literal(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted_path() {
        let expr = parse_expression("trigger.item.attributes.Priority").unwrap();
        // Nested property accesses rooted at an identifier.
        match expr {
            Expr::Property { name, base } => {
                assert_eq!(name, "Priority");
                assert!(matches!(*base, Expr::Property { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_pipe_chain() {
        let expr = parse_expression(r#"trigger.item.attributes.Tags | join(" / ") | toUpperCase"#);
        match expr.unwrap() {
            Expr::Binary { op, .. } => assert_eq!(op, BinaryOp::Pipe),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_method_with_args() {
        let expr = parse_expression("name.truncate(10, \"…\")").unwrap();
        match expr {
            Expr::Method { name, args, .. } => {
                assert_eq!(name, "truncate");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_index_and_literals() {
        let expr = parse_expression("action[0].result.itemId").unwrap();
        assert!(matches!(expr, Expr::Property { .. }));

        assert_eq!(
            parse_expression("-3.5").unwrap(),
            Expr::Literal(serde_json::json!(-3.5))
        );
        assert_eq!(parse_expression("null").unwrap(), Expr::Literal(Value::Null));
        assert_eq!(
            parse_expression("true").unwrap(),
            Expr::Literal(Value::Bool(true))
        );
    }

    #[test]
    fn test_parse_comparison_precedence() {
        // '+' binds tighter than '=='.
        let expr = parse_expression("a + 1 == b").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Eq, lhs, .. } => {
                assert!(matches!(*lhs, Expr::Binary { op: BinaryOp::Add, .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oql_prefix_consumes_remainder() {
        let expr = parse_expression("oql: FROM Ticket WHERE Status = \"Open\"").unwrap();
        assert_eq!(
            expr,
            Expr::Oql("FROM Ticket WHERE Status = \"Open\"".to_string())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("a ~ b").is_err());
        assert!(parse_expression("\"unterminated").is_err());
    }
}
