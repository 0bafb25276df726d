//! Route criteria: small boolean expressions evaluated against a request.
//!
//! ```text
//! $.method == 'POST' && $.header.content-type =~ '^application/json'
//! !($.query.debug == '1') || $.host == 'admin.internal'
//! $.header.x-tenant
//! ```
//!
//! Operands are request attributes (`$.method`, `$.path`, `$.host`,
//! `$.scheme`, `$.header.<name>`, `$.query.<name>`) or quoted literals.
//! Comparisons are `==`, `!=`, `=~` and `!~` (regex, right side must be a
//! literal). A bare attribute is true when present and non-empty.

use std::fmt;

use regex::Regex;

use crate::error::ConfigError;
use crate::proxy::router::RouteRequest;

/// A parsed criterion.
#[derive(Clone)]
pub struct Criterion {
    source: String,
    expr: Expr,
}

impl Criterion {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(criteria_error(format!("unexpected `{token}` in `{source}`")));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, request: &RouteRequest) -> bool {
        self.expr.eval(request)
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Criterion").field(&self.source).finish()
    }
}

fn criteria_error(reason: impl fmt::Display) -> ConfigError {
    ConfigError::invalid("criteria", reason)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Attribute {
    Method,
    Path,
    Host,
    Scheme,
    Header(String),
    Query(String),
}

impl Attribute {
    fn resolve(&self, request: &RouteRequest) -> Option<String> {
        match self {
            Self::Method => request.method.clone(),
            Self::Path => Some(request.path.clone()),
            Self::Host => request.host.clone(),
            Self::Scheme => Some(request.scheme.clone()),
            Self::Header(name) => request.header(name).map(str::to_string),
            Self::Query(name) => request.query_param(name),
        }
    }
}

#[derive(Debug, Clone)]
enum Operand {
    Attribute(Attribute),
    Literal(String),
}

impl Operand {
    fn resolve(&self, request: &RouteRequest) -> Option<String> {
        match self {
            Self::Attribute(attr) => attr.resolve(request),
            Self::Literal(value) => Some(value.clone()),
        }
    }
}

#[derive(Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Eq(Operand, Operand),
    Ne(Operand, Operand),
    Matches(Operand, Regex),
    NotMatches(Operand, Regex),
    Present(Attribute),
}

impl Expr {
    fn eval(&self, request: &RouteRequest) -> bool {
        match self {
            Self::Or(a, b) => a.eval(request) || b.eval(request),
            Self::And(a, b) => a.eval(request) && b.eval(request),
            Self::Not(inner) => !inner.eval(request),
            Self::Eq(a, b) => {
                matches!((a.resolve(request), b.resolve(request)), (Some(x), Some(y)) if x == y)
            }
            Self::Ne(a, b) => a.resolve(request) != b.resolve(request),
            Self::Matches(a, re) => a.resolve(request).is_some_and(|v| re.is_match(&v)),
            Self::NotMatches(a, re) => !a.resolve(request).is_some_and(|v| re.is_match(&v)),
            Self::Present(attr) => attr.resolve(request).is_some_and(|v| !v.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Attribute(Attribute),
    Literal(String),
    Eq,
    Ne,
    Match,
    NotMatch,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(a) => write!(f, "{a:?}"),
            Self::Literal(s) => write!(f, "'{s}'"),
            Self::Eq => f.write_str("=="),
            Self::Ne => f.write_str("!="),
            Self::Match => f.write_str("=~"),
            Self::NotMatch => f.write_str("!~"),
            Self::And => f.write_str("&&"),
            Self::Or => f.write_str("||"),
            Self::Not => f.write_str("!"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConfigError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' if next == Some('~') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' if next == Some('~') => {
                tokens.push(Token::NotMatch);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let (literal, end) = read_literal(&chars, i)?;
                tokens.push(Token::Literal(literal));
                i = end;
            }
            '$' if next == Some('.') => {
                let start = i + 2;
                let mut end = start;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || matches!(chars[end], '.' | '-' | '_'))
                {
                    end += 1;
                }
                let path: String = chars[start..end].iter().collect();
                tokens.push(Token::Attribute(parse_attribute(&path)?));
                i = end;
            }
            other => {
                return Err(criteria_error(format!(
                    "unexpected character `{other}` at offset {i} in `{source}`"
                )))
            }
        }
    }
    Ok(tokens)
}

fn read_literal(chars: &[char], start: usize) -> Result<(String, usize), ConfigError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() && (chars[i + 1] == quote || chars[i + 1] == '\\') => {
                out.push(chars[i + 1]);
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(criteria_error("unterminated string literal"))
}

fn parse_attribute(path: &str) -> Result<Attribute, ConfigError> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let attr = match (head, rest) {
        ("method", None) => Attribute::Method,
        ("path", None) => Attribute::Path,
        ("host", None) => Attribute::Host,
        ("scheme", None) => Attribute::Scheme,
        ("header" | "headers", Some(name)) if !name.is_empty() => {
            Attribute::Header(name.to_ascii_lowercase())
        }
        ("query", Some(name)) if !name.is_empty() => Attribute::Query(name.to_string()),
        _ => return Err(criteria_error(format!("unknown attribute `$.{path}`"))),
    };
    Ok(attr)
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
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Expr, ConfigError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ConfigError> {
        let mut lhs = self.unary()?;
        while self.eat(&Token::And) {
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ConfigError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::LParen) {
            let inner = self.expr()?;
            if !self.eat(&Token::RParen) {
                return Err(criteria_error("missing `)`"));
            }
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConfigError> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq | Token::Ne | Token::Match | Token::NotMatch) => self.next(),
            _ => None,
        };
        let Some(op) = op else {
            return match lhs {
                Operand::Attribute(attr) => Ok(Expr::Present(attr)),
                Operand::Literal(value) => Err(criteria_error(format!(
                    "literal '{value}' is not a condition"
                ))),
            };
        };

        let rhs = self.operand()?;
        match op {
            Token::Eq => Ok(Expr::Eq(lhs, rhs)),
            Token::Ne => Ok(Expr::Ne(lhs, rhs)),
            Token::Match | Token::NotMatch => {
                let Operand::Literal(pattern) = rhs else {
                    return Err(criteria_error("regex operand must be a literal"));
                };
                let re = Regex::new(&pattern)
                    .map_err(|e| criteria_error(format!("invalid regex '{pattern}': {e}")))?;
                if op == Token::Match {
                    Ok(Expr::Matches(lhs, re))
                } else {
                    Ok(Expr::NotMatches(lhs, re))
                }
            }
            _ => Err(criteria_error(format!("unexpected `{op}`"))),
        }
    }

    fn operand(&mut self) -> Result<Operand, ConfigError> {
        match self.next() {
            Some(Token::Attribute(attr)) => Ok(Operand::Attribute(attr)),
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(other) => Err(criteria_error(format!("expected operand, found `{other}`"))),
            None => Err(criteria_error("unexpected end of expression")),
        }
    }
}
