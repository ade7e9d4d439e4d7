//! Boolean predicates over row or column attributes.
//!
//! A predicate such as `Gene == 'Actb' | (_Total > 100 & ~Valid)` is parsed
//! into an [`Expr`] and evaluated against one axis' attributes, yielding a
//! [`Mask`]. Literal-only predicates (`True`, `1 < 2`) evaluate to a scalar
//! that selects everything or nothing.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use loom_core::{LoomError, Result};

use crate::attribute::Attribute;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ord: Option<Ordering>) -> bool {
        match (self, ord) {
            (CmpOp::Ne, None) => true,
            (_, None) => false,
            (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
            (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
            (CmpOp::Lt, Some(o)) => o == Ordering::Less,
            (CmpOp::Le, Some(o)) => o != Ordering::Greater,
            (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
            (CmpOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// An attribute name.
    Attr(String),
    /// A numeric literal.
    Number(f64),
    /// A quoted string literal.
    Str(String),
}

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `True` or `False`.
    Const(bool),
    /// A bare operand, true where non-zero.
    Truthy(Operand),
    Compare(Operand, CmpOp, Operand),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

/// Result of evaluating a predicate on one axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Mask {
    /// Applies to every element.
    Scalar(bool),
    /// One flag per element.
    Vector(Vec<bool>),
}

impl Mask {
    /// Indices of the selected elements out of `len`.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        match self {
            Mask::Scalar(true) => (0..len).collect(),
            Mask::Scalar(false) => Vec::new(),
            Mask::Vector(v) => v
                .iter()
                .enumerate()
                .filter(|&(_, &keep)| keep)
                .map(|(i, _)| i)
                .collect(),
        }
    }

    fn not(self) -> Mask {
        match self {
            Mask::Scalar(b) => Mask::Scalar(!b),
            Mask::Vector(v) => Mask::Vector(v.into_iter().map(|b| !b).collect()),
        }
    }

    fn combine(self, other: Mask, f: impl Fn(bool, bool) -> bool) -> Mask {
        match (self, other) {
            (Mask::Scalar(a), Mask::Scalar(b)) => Mask::Scalar(f(a, b)),
            (Mask::Scalar(a), Mask::Vector(v)) => {
                Mask::Vector(v.into_iter().map(|b| f(a, b)).collect())
            }
            (Mask::Vector(v), Mask::Scalar(b)) => {
                Mask::Vector(v.into_iter().map(|a| f(a, b)).collect())
            }
            (Mask::Vector(a), Mask::Vector(b)) => {
                Mask::Vector(a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

// Grammar:
//   or      = and (('|' | '||' | 'or') and)*
//   and     = unary (('&' | '&&' | 'and') unary)*
//   unary   = ('~' | '!' | 'not') unary | primary
//   primary = '(' or ')' | 'True' | 'False' | operand (cmp operand)?

struct PredicateParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> PredicateParser<'a> {
    fn new(input: &'a str) -> Self {
        PredicateParser {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.input.get(self.pos), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    fn error(&self, msg: &str) -> LoomError {
        LoomError::Parse(format!("{msg} at position {}", self.pos))
    }

    /// Consume `word` if it is the next whole identifier.
    fn eat_keyword(&mut self, word: &str) -> bool {
        self.skip_ws();
        let end = self.pos + word.len();
        if self.input.get(self.pos..end) == Some(word.as_bytes())
            && !matches!(self.input.get(end), Some(&c) if is_ident_char(c))
        {
            self.pos = end;
            true
        } else {
            false
        }
    }

    fn eat_symbol(&mut self, sym: u8) -> bool {
        if self.peek() == Some(sym) {
            self.pos += 1;
            if self.peek_at(0) == Some(sym) {
                self.pos += 1;
            }
            true
        } else {
            false
        }
    }

    fn parse(&mut self) -> Result<Expr> {
        let expr = self.parse_or()?;
        if self.peek().is_some() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_and()?];
        while self.eat_symbol(b'|') || self.eat_keyword("or") {
            terms.push(self.parse_and()?);
        }
        if terms.len() == 1 {
            Ok(terms.remove(0))
        } else {
            Ok(Expr::Or(terms))
        }
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat_symbol(b'&') || self.eat_keyword("and") {
            terms.push(self.parse_unary()?);
        }
        if terms.len() == 1 {
            Ok(terms.remove(0))
        } else {
            Ok(Expr::And(terms))
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(b'~') => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(b'!') if self.peek_at(1) != Some(b'=') => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ if self.eat_keyword("not") => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.peek() != Some(b')') {
                return Err(self.error("expected ')'"));
            }
            self.pos += 1;
            return Ok(inner);
        }
        if self.eat_keyword("True") || self.eat_keyword("true") {
            return Ok(Expr::Const(true));
        }
        if self.eat_keyword("False") || self.eat_keyword("false") {
            return Ok(Expr::Const(false));
        }
        let lhs = self.parse_operand()?;
        match self.parse_cmp_op() {
            Some(op) => {
                let rhs = self.parse_operand()?;
                Ok(Expr::Compare(lhs, op, rhs))
            }
            None => Ok(Expr::Truthy(lhs)),
        }
    }

    fn parse_cmp_op(&mut self) -> Option<CmpOp> {
        let (op, width) = match (self.peek()?, self.peek_at(1)) {
            (b'=', Some(b'=')) => (CmpOp::Eq, 2),
            (b'!', Some(b'=')) => (CmpOp::Ne, 2),
            (b'<', Some(b'=')) => (CmpOp::Le, 2),
            (b'>', Some(b'=')) => (CmpOp::Ge, 2),
            (b'<', _) => (CmpOp::Lt, 1),
            (b'>', _) => (CmpOp::Gt, 1),
            _ => return None,
        };
        self.pos += width;
        Some(op)
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.peek() {
            Some(q @ (b'\'' | b'"')) => {
                let start = self.pos + 1;
                let len = self.input[start..]
                    .iter()
                    .position(|&c| c == q)
                    .ok_or_else(|| self.error("unterminated string"))?;
                self.pos = start + len + 1;
                let text = std::str::from_utf8(&self.input[start..start + len])
                    .map_err(|_| self.error("invalid UTF-8 in string"))?;
                Ok(Operand::Str(text.to_string()))
            }
            Some(c) if c.is_ascii_digit() || c == b'-' || c == b'.' => {
                let start = self.pos;
                self.pos += 1;
                while matches!(self.peek_at(0), Some(c) if c.is_ascii_alphanumeric() || c == b'.')
                    || (matches!(self.peek_at(0), Some(b'-' | b'+'))
                        && matches!(self.input.get(self.pos - 1), Some(b'e' | b'E')))
                {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| self.error("invalid number"))?;
                text.parse::<f64>()
                    .map(Operand::Number)
                    .map_err(|_| self.error(&format!("invalid number '{text}'")))
            }
            Some(c) if is_ident_char(c) => {
                let start = self.pos;
                while matches!(self.peek_at(0), Some(c) if is_ident_char(c)) {
                    self.pos += 1;
                }
                let name = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| self.error("invalid identifier"))?;
                Ok(Operand::Attr(name.to_string()))
            }
            Some(_) => Err(self.error("expected attribute, number or string")),
            None => Err(self.error("unexpected end of predicate")),
        }
    }
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

enum Values<'a> {
    Num(f64),
    Str(&'a str),
    NumVec(Vec<f64>),
    StrVec(&'a [String]),
}

fn resolve<'a>(
    operand: &'a Operand,
    attrs: &'a BTreeMap<String, Attribute>,
) -> Result<Values<'a>> {
    match operand {
        Operand::Number(n) => Ok(Values::Num(*n)),
        Operand::Str(s) => Ok(Values::Str(s)),
        Operand::Attr(name) => match attrs.get(name) {
            Some(Attribute::String(v)) => Ok(Values::StrVec(v)),
            Some(a) => Ok(Values::NumVec(a.to_f64().unwrap_or_default())),
            None => Err(LoomError::NotFound(format!("attribute '{name}'"))),
        },
    }
}

fn compare(lhs: Values<'_>, op: CmpOp, rhs: Values<'_>) -> Result<Mask> {
    use Values::*;
    let num = |a: f64, b: f64| op.holds(a.partial_cmp(&b));
    let text = |a: &str, b: &str| op.holds(Some(a.cmp(b)));
    Ok(match (lhs, rhs) {
        (Num(a), Num(b)) => Mask::Scalar(num(a, b)),
        (Str(a), Str(b)) => Mask::Scalar(text(a, b)),
        (NumVec(v), Num(b)) => Mask::Vector(v.iter().map(|&a| num(a, b)).collect()),
        (Num(a), NumVec(v)) => Mask::Vector(v.iter().map(|&b| num(a, b)).collect()),
        (NumVec(x), NumVec(y)) => Mask::Vector(x.iter().zip(&y).map(|(&a, &b)| num(a, b)).collect()),
        (StrVec(v), Str(b)) => Mask::Vector(v.iter().map(|a| text(a, b)).collect()),
        (Str(a), StrVec(v)) => Mask::Vector(v.iter().map(|b| text(a, b)).collect()),
        (StrVec(x), StrVec(y)) => Mask::Vector(x.iter().zip(y).map(|(a, b)| text(a, b)).collect()),
        _ => {
            return Err(LoomError::Schema(
                "cannot compare a string with a number".into(),
            ))
        }
    })
}

impl Expr {
    /// Parse predicate text.
    pub fn parse(text: &str) -> Result<Expr> {
        if text.trim().is_empty() {
            return Err(LoomError::Parse("empty predicate".into()));
        }
        PredicateParser::new(text).parse()
    }

    /// Evaluate against the attributes of one axis.
    pub fn evaluate(&self, attrs: &BTreeMap<String, Attribute>) -> Result<Mask> {
        match self {
            Expr::Const(b) => Ok(Mask::Scalar(*b)),
            Expr::Truthy(operand) => match resolve(operand, attrs)? {
                Values::Num(n) => Ok(Mask::Scalar(n != 0.0)),
                Values::NumVec(v) => Ok(Mask::Vector(v.iter().map(|&x| x != 0.0).collect())),
                Values::Str(_) | Values::StrVec(_) => Err(LoomError::Schema(
                    "a string cannot be used as a condition".into(),
                )),
            },
            Expr::Compare(lhs, op, rhs) => {
                compare(resolve(lhs, attrs)?, *op, resolve(rhs, attrs)?)
            }
            Expr::Not(inner) => Ok(inner.evaluate(attrs)?.not()),
            Expr::And(terms) => terms.iter().try_fold(Mask::Scalar(true), |acc, t| {
                Ok(acc.combine(t.evaluate(attrs)?, |a, b| a && b))
            }),
            Expr::Or(terms) => terms.iter().try_fold(Mask::Scalar(false), |acc, t| {
                Ok(acc.combine(t.evaluate(attrs)?, |a, b| a || b))
            }),
        }
    }
}

/// Parse and evaluate `text`, returning the selected indices out of `len`.
pub fn select_indices(
    text: &str,
    attrs: &BTreeMap<String, Attribute>,
    len: usize,
) -> Result<Vec<usize>> {
    Ok(Expr::parse(text)?.evaluate(attrs)?.indices(len))
}
