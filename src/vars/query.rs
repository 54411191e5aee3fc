//! A small jq-style query language evaluated against a JSON document.
//!
//! Supported syntax:
//! - pipelines: `a | b` (an empty stage is the identity, so `|false` is `false`)
//! - paths: `.`, `.a.b`, `.a[0]`, `.["key with spaces"]`
//! - literals: `true`, `false`, `null`, numbers, `"strings"`
//! - comparisons: `== != < <= > >=`
//! - boolean operators: `and`, `or`, and the `not` filter
//! - the `length` filter and parentheses

use super::VarsError;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Ident(String),
    Str(String),
    Num(f64),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Pipe,
    Op(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Identity,
    Path(Vec<Segment>),
    Literal(Value),
    Pipe(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not,
    Length,
}

/// A parsed query, reusable against any number of inputs.
#[derive(Debug, Clone)]
pub struct Query {
    source: String,
    expr: Expr,
}

impl Query {
    pub fn parse(source: &str) -> Result<Self, VarsError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_pipe()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, input: &Value) -> Result<Value, VarsError> {
        eval(&self.expr, input).map_err(|message| VarsError::QueryEval {
            query: self.source.clone(),
            message,
        })
    }
}

/// jq truthiness: only `false` and `null` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn tokenize(source: &str) -> Result<Vec<Token>, VarsError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |message: String| VarsError::QueryParse {
        query: source.to_string(),
        message,
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('>', _) => (CmpOp::Gt, 1),
                    _ => return Err(err(format!("unexpected character '{c}' at {i}"))),
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string".to_string())),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| err("unterminated escape".to_string()))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character '{other}' at {i}"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> VarsError {
        VarsError::QueryParse {
            query: self.source.to_string(),
            message: format!("{message} (token {})", self.pos),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), VarsError> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            _ => Err(self.error(&format!("expected {expected:?}"))),
        }
    }

    fn at_stage_end(&self) -> bool {
        matches!(self.peek(), None | Some(Token::Pipe) | Some(Token::RParen))
    }

    fn parse_pipe(&mut self) -> Result<Expr, VarsError> {
        let mut expr = self.parse_stage()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.pos += 1;
            let rhs = self.parse_stage()?;
            expr = Expr::Pipe(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_stage(&mut self) -> Result<Expr, VarsError> {
        if self.at_stage_end() {
            return Ok(Expr::Identity);
        }
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, VarsError> {
        let mut expr = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Ident(s)) if s == "or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, VarsError> {
        let mut expr = self.parse_compare()?;
        while matches!(self.peek(), Some(Token::Ident(s)) if s == "and") {
            self.pos += 1;
            let rhs = self.parse_compare()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_compare(&mut self) -> Result<Expr, VarsError> {
        let lhs = self.parse_term()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.parse_term()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, VarsError> {
        match self.next() {
            Some(Token::Dot) => self.parse_path(),
            Some(Token::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_pipe()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "not" => Ok(Expr::Not),
                "length" => Ok(Expr::Length),
                _ => Err(self.error(&format!("unknown identifier '{word}'"))),
            },
            _ => Err(self.error("expected expression")),
        }
    }

    /// Parses the remainder of a path after its leading dot.
    fn parse_path(&mut self) -> Result<Expr, VarsError> {
        let mut segments = Vec::new();

        // `.foo` directly after the leading dot
        if let Some(Token::Ident(name)) = self.peek().cloned() {
            self.pos += 1;
            segments.push(Segment::Key(name));
        } else if let Some(Token::Str(name)) = self.peek().cloned() {
            self.pos += 1;
            segments.push(Segment::Key(name));
        }

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) | Some(Token::Str(name)) => {
                            segments.push(Segment::Key(name))
                        }
                        _ => return Err(self.error("expected key after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Num(n)) => segments.push(Segment::Index(n as i64)),
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        _ => return Err(self.error("expected index or key in brackets")),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }

        if segments.is_empty() {
            Ok(Expr::Identity)
        } else {
            Ok(Expr::Path(segments))
        }
    }
}

fn eval(expr: &Expr, input: &Value) -> Result<Value, String> {
    match expr {
        Expr::Identity => Ok(input.clone()),
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => {
            let mut current = input;
            for segment in segments {
                current = match (segment, current) {
                    (_, Value::Null) => return Ok(Value::Null),
                    (Segment::Key(key), Value::Object(map)) => match map.get(key) {
                        Some(v) => v,
                        None => return Ok(Value::Null),
                    },
                    (Segment::Index(idx), Value::Array(items)) => {
                        let len = items.len() as i64;
                        let real = if *idx < 0 { len + idx } else { *idx };
                        match usize::try_from(real).ok().and_then(|i| items.get(i)) {
                            Some(v) => v,
                            None => return Ok(Value::Null),
                        }
                    }
                    (Segment::Key(key), other) => {
                        return Err(format!("cannot index {} with \"{key}\"", type_name(other)));
                    }
                    (Segment::Index(idx), other) => {
                        return Err(format!("cannot index {} with number {idx}", type_name(other)));
                    }
                };
            }
            Ok(current.clone())
        }
        Expr::Pipe(lhs, rhs) => {
            let mid = eval(lhs, input)?;
            eval(rhs, &mid)
        }
        Expr::Compare(op, lhs, rhs) => {
            let a = eval(lhs, input)?;
            let b = eval(rhs, input)?;
            let ord = compare_values(&a, &b);
            Ok(Value::Bool(match op {
                CmpOp::Eq => ord == Ordering::Equal,
                CmpOp::Ne => ord != Ordering::Equal,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
            }))
        }
        Expr::And(lhs, rhs) => {
            let a = eval(lhs, input)?;
            if !is_truthy(&a) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(rhs, input)?)))
        }
        Expr::Or(lhs, rhs) => {
            let a = eval(lhs, input)?;
            if is_truthy(&a) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(rhs, input)?)))
        }
        Expr::Not => Ok(Value::Bool(!is_truthy(input))),
        Expr::Length => match input {
            Value::Null => Ok(Value::from(0)),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::Number(n) => Ok(Value::from(n.as_f64().map_or(0.0, f64::abs))),
            Value::Bool(_) => Err("boolean has no length".to_string()),
        },
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Total order over JSON values following jq's sort order.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => {
            if a == b {
                Ordering::Equal
            } else {
                a.to_string().cmp(&b.to_string())
            }
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
