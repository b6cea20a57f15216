//! Device filter expressions.
//!
//! A small comparison language over [`DeviceDescriptor`] fields, e.g.
//!
//! ```text
//! identity.manufacturer_id == 0x6f && usb_description ~= 'Pico'
//! ```
//!
//! Expressions are parsed once into a [`Predicate`] tree and evaluated
//! without any dynamic code execution.

use crate::discovery::{DeviceDescriptor, Field, FieldValue};
use crate::error::{BridgeError, Result};
use log::{error, warn};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Str(String),
    Int(u32),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare(Field, CompareOp, Literal),
    /// Bare field: true when present (or set, for flags).
    Truthy(Field),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Predicate> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(BridgeError::Configuration(format!(
                "unexpected {:?} in match expression",
                token
            )));
        }
        Ok(predicate)
    }

    pub fn evaluate(&self, descriptor: &DeviceDescriptor) -> Result<bool> {
        match self {
            Predicate::Compare(field, op, literal) => {
                compare(*field, &field.value_of(descriptor), *op, literal)
            }
            Predicate::Truthy(field) => Ok(match field.value_of(descriptor) {
                FieldValue::Flag(b) => b,
                other => other.is_present(),
            }),
            Predicate::Not(inner) => Ok(!inner.evaluate(descriptor)?),
            Predicate::And(a, b) => Ok(a.evaluate(descriptor)? && b.evaluate(descriptor)?),
            Predicate::Or(a, b) => Ok(a.evaluate(descriptor)? || b.evaluate(descriptor)?),
        }
    }
}

/// Decides whether a discovered device should be bridged.
///
/// Without an expression every device matches. A broken expression is
/// logged once when the evaluator is built and then rejects every device.
/// An expression that fails on one descriptor rejects it with a warning.
/// Neither aborts discovery.
#[derive(Debug, Clone)]
pub struct MatchEvaluator {
    source: Option<String>,
    predicate: Option<std::result::Result<Predicate, String>>,
}

impl MatchEvaluator {
    pub fn accept_all() -> Self {
        Self {
            source: None,
            predicate: None,
        }
    }

    pub fn new(expression: Option<&str>) -> Self {
        let source = match expression {
            None => return Self::accept_all(),
            Some(source) => source,
        };
        let predicate = Predicate::parse(source).map_err(|e| e.to_string());
        if let Err(reason) = &predicate {
            error!(
                "Invalid match expression {:?}: {}. No device will match.",
                source, reason
            );
        }
        Self {
            source: Some(source.to_string()),
            predicate: Some(predicate),
        }
    }

    pub fn expression(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// The parse error, if the expression could not be parsed.
    pub fn parse_error(&self) -> Option<&str> {
        match &self.predicate {
            Some(Err(e)) => Some(e.as_str()),
            _ => None,
        }
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        match &self.predicate {
            None => true,
            // Already reported in `new`.
            Some(Err(_)) => false,
            Some(Ok(predicate)) => match predicate.evaluate(descriptor) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(
                        "Match expression failed on {}: {}",
                        descriptor.device_path, e
                    );
                    false
                }
            },
        }
    }
}

impl Default for MatchEvaluator {
    fn default() -> Self {
        Self::accept_all()
    }
}

fn compare(field: Field, value: &FieldValue, op: CompareOp, literal: &Literal) -> Result<bool> {
    if !value.is_present() || *literal == Literal::None {
        return absent_compare(value.is_present(), op, literal);
    }

    let ordering = match (value, literal) {
        (FieldValue::Text(Some(text)), Literal::Str(s)) => {
            if op == CompareOp::Contains {
                return Ok(text.contains(s.as_str()));
            }
            text.as_str().cmp(s.as_str())
        }
        (FieldValue::Number(Some(n)), Literal::Int(i)) => n.cmp(i),
        (FieldValue::Number(Some(n)), Literal::Str(s)) => match parse_int(s) {
            Some(i) => n.cmp(&i),
            None => return Err(mismatch(field, literal)),
        },
        (FieldValue::Flag(b), Literal::Bool(l)) => b.cmp(l),
        (FieldValue::Bytes(Some(bytes)), Literal::Str(s)) => match parse_dotted(s) {
            Some(parsed) => bytes.cmp(&parsed),
            None => return Err(mismatch(field, literal)),
        },
        (FieldValue::Bytes(Some(bytes)), Literal::Int(i)) if bytes.len() == 1 => {
            u32::from(bytes[0]).cmp(i)
        }
        _ => return Err(mismatch(field, literal)),
    };

    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Contains => return Err(mismatch(field, literal)),
    })
}

fn absent_compare(present: bool, op: CompareOp, literal: &Literal) -> Result<bool> {
    let both_absent = !present && *literal == Literal::None;
    match op {
        CompareOp::Eq => Ok(both_absent),
        CompareOp::Ne => Ok(!both_absent),
        _ if *literal == Literal::None => Err(BridgeError::Configuration(
            "'none' only supports == and !=".to_string(),
        )),
        _ => Ok(false),
    }
}

fn mismatch(field: Field, literal: &Literal) -> BridgeError {
    BridgeError::Configuration(format!("cannot compare {} with {:?}", field, literal))
}

fn parse_int(text: &str) -> Option<u32> {
    let text = text.trim();
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_dotted(text: &str) -> Option<Vec<u8>> {
    text.split('.').map(|part| part.trim().parse().ok()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(u32),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let syntax = |msg: String| BridgeError::Configuration(format!("match expression: {}", msg));

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
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
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '~' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Contains));
                i += 2;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == c)
                    .ok_or_else(|| syntax(format!("unterminated string at {}", i)))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() => {
                let len = chars[i..]
                    .iter()
                    .take_while(|ch| ch.is_ascii_alphanumeric())
                    .count();
                let text: String = chars[i..i + len].iter().collect();
                let value =
                    parse_int(&text).ok_or_else(|| syntax(format!("bad number '{}'", text)))?;
                tokens.push(Token::Int(value));
                i += len;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let len = chars[i..]
                    .iter()
                    .take_while(|ch| ch.is_ascii_alphanumeric() || **ch == '_' || **ch == '.')
                    .count();
                tokens.push(Token::Ident(chars[i..i + len].iter().collect()));
                i += len;
            }
            other => return Err(syntax(format!("unexpected character '{}'", other))),
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

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate> {
        match self.advance() {
            Some(Token::Not) => Ok(Predicate::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(expected("')'", other)),
                }
            }
            Some(Token::Ident(name)) => {
                let field = Field::lookup(&name).ok_or_else(|| {
                    BridgeError::Configuration(format!("unknown field '{}'", name))
                })?;
                match self.peek() {
                    Some(Token::Op(op)) => {
                        let op = *op;
                        self.pos += 1;
                        let literal = self.parse_literal()?;
                        Ok(Predicate::Compare(field, op, literal))
                    }
                    _ => Ok(Predicate::Truthy(field)),
                }
            }
            other => Err(expected("a field name", other)),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Int(i)) => Ok(Literal::Int(i)),
            Some(Token::Ident(word)) => match word.to_ascii_lowercase().as_str() {
                "true" => Ok(Literal::Bool(true)),
                "false" => Ok(Literal::Bool(false)),
                "none" | "null" => Ok(Literal::None),
                _ => Err(expected("a literal", Some(Token::Ident(word)))),
            },
            other => Err(expected("a literal", other)),
        }
    }
}

fn expected(what: &str, found: Option<Token>) -> BridgeError {
    match found {
        Some(token) => BridgeError::Configuration(format!(
            "match expression: expected {}, found {:?}",
            what, token
        )),
        None => BridgeError::Configuration(format!(
            "match expression: expected {}, found end of input",
            what
        )),
    }
}
