//! Route conditions: small boolean expressions over state.
//!
//! Supported:
//! - comparisons `== != > >= < <=`
//! - `contains` (substring, list membership, object key) and `in` (reverse)
//! - `and`, `or`, `not`, parentheses
//! - literals: numbers, `"double"` / `'single'` quoted strings, `true`, `false`, `null`
//! - dotted state paths, optionally prefixed with `state.`
//!
//! A bare path is truthy unless it is null, false, zero or empty. Missing
//! paths read as null.

use serde_json::{Map, Value};

use crate::template::walk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(String),
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Condition {
    /// Parse an expression. The error is a human-readable reason.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err("empty condition".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let cond = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected {:?} after expression", tok));
        }
        Ok(cond)
    }

    /// Evaluate against the current state.
    pub fn evaluate(&self, state: &Map<String, Value>) -> bool {
        match self {
            Self::Compare(l, op, r) => compare(&l.value(state), *op, &r.value(state)),
            Self::Truthy(o) => truthy(&o.value(state)),
            Self::Not(c) => !c.evaluate(state),
            Self::And(a, b) => a.evaluate(state) && b.evaluate(state),
            Self::Or(a, b) => a.evaluate(state) || b.evaluate(state),
        }
    }

    /// State fields (first path segment) this condition reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        let mut push = |o: &'a Operand| {
            if let Operand::Path(p) = o {
                let p = p.strip_prefix("state.").unwrap_or(p);
                out.push(p.split('.').next().unwrap_or(p));
            }
        };
        match self {
            Self::Compare(l, _, r) => {
                push(l);
                push(r);
            }
            Self::Truthy(o) => push(o),
            Self::Not(c) => c.collect_fields(out),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
        }
    }
}

impl Operand {
    fn value(&self, state: &Map<String, Value>) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(p) => {
                let p = p.strip_prefix("state.").unwrap_or(p);
                let (head, rest) = match p.split_once('.') {
                    Some((h, r)) => (h, Some(r)),
                    None => (p, None),
                };
                let root = state.get(head);
                match (root, rest) {
                    (Some(v), Some(rest)) => walk(v, rest).cloned().unwrap_or(Value::Null),
                    (Some(v), None) => v.clone(),
                    (None, _) => Value::Null,
                }
            }
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(l: &Value, op: CmpOp, r: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(l, r),
        CmpOp::Ne => !values_equal(l, r),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let ord = match (l, r) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ord {
                Some(o) => match op {
                    CmpOp::Gt => o.is_gt(),
                    CmpOp::Ge => o.is_ge(),
                    CmpOp::Lt => o.is_lt(),
                    _ => o.is_le(),
                },
                None => false,
            }
        }
        CmpOp::Contains => contains(l, r),
        CmpOp::In => contains(r, l),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|i| values_equal(i, n)),
        (Value::Object(map), Value::String(k)) => map.contains_key(k),
        _ => false,
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string".to_string()),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' | '!' | '>' | '<' => {
                let next = chars.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', _) => (CmpOp::Gt, 1),
                    ('<', _) => (CmpOp::Lt, 1),
                    _ => return Err(format!("unexpected '{}'", c)),
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            _ if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CmpOp::Contains),
                    "in" => Token::Op(CmpOp::In),
                    _ => {
                        if word.ends_with('.') || word.contains("..") {
                            return Err(format!("malformed path '{}'", word));
                        }
                        Token::Ident(word)
                    }
                });
            }
            _ => return Err(format!("unexpected '{}'", c)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err("missing ')'".to_string());
            }
            return Ok(inner);
        }

        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Condition::Compare(left, op, right));
        }
        Ok(Condition::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Operand::Literal(number(n))),
            Some(Token::Ident(w)) => Ok(match w.as_str() {
                "true" => Operand::Literal(Value::Bool(true)),
                "false" => Operand::Literal(Value::Bool(false)),
                "null" | "none" => Operand::Literal(Value::Null),
                _ => Operand::Path(w),
            }),
            Some(tok) => Err(format!("expected a value, found {:?}", tok)),
            None => Err("expression ends early".to_string()),
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
