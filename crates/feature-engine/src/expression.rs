//! Arithmetic expressions over parameters.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | primary
//! primary := NUMBER | '{' reference '}' | '(' expr ')'
//! ```
//!
//! A reference is `{feature:name}`, or `{name}` for a parameter of the
//! feature that owns the expression. Referenced parameters that are
//! themselves expression-driven are evaluated recursively; a reference
//! chain that comes back to a parameter already being evaluated is a
//! `CircularReference`.

use model_types::{FeatureId, ParameterKey};

/// Errors from parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token at {pos}")]
    UnexpectedToken { pos: usize },

    #[error("invalid number '{text}'")]
    InvalidNumber { text: String },

    #[error("invalid reference '{text}'")]
    InvalidReference { text: String },

    #[error("unknown parameter {key}")]
    UnknownReference { key: String },

    #[error("circular reference: {chain}")]
    CircularReference { chain: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NotFinite,
}

/// Read access to cached parameter values and their expressions.
pub trait ParameterLookup {
    fn lookup(&self, key: &ParameterKey) -> Option<(f64, Option<&str>)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Reference(ParameterKey),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Every parameter referenced by the expression, in source order.
    pub fn references(&self) -> Vec<ParameterKey> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<ParameterKey>) {
        match self {
            Expr::Number(_) => {}
            Expr::Reference(key) => out.push(key.clone()),
            Expr::Neg(inner) => inner.collect_references(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_references(out);
                rhs.collect_references(out);
            }
        }
    }

    /// Evaluate with `resolve` supplying referenced values.
    pub fn evaluate(
        &self,
        resolve: &mut dyn FnMut(&ParameterKey) -> Result<f64, ExpressionError>,
    ) -> Result<f64, ExpressionError> {
        match self {
            Expr::Number(v) => Ok(*v),
            Expr::Reference(key) => resolve(key),
            Expr::Neg(inner) => Ok(-inner.evaluate(resolve)?),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.evaluate(resolve)?;
                let r = rhs.evaluate(resolve)?;
                match op {
                    BinaryOp::Add => Ok(l + r),
                    BinaryOp::Sub => Ok(l - r),
                    BinaryOp::Mul => Ok(l * r),
                    BinaryOp::Div => {
                        if r == 0.0 {
                            Err(ExpressionError::DivisionByZero)
                        } else {
                            Ok(l / r)
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Reference(ParameterKey),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(text: &str, owner: &FeatureId) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '+' => {
                tokens.push((i, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((i, Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push((i, Token::Star));
                i += 1;
            }
            '/' => {
                tokens.push((i, Token::Slash));
                i += 1;
            }
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '{' => {
                let start = i;
                let close = chars[i..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .ok_or(ExpressionError::UnexpectedEnd)?;
                let body: String = chars[i + 1..i + close].iter().collect();
                tokens.push((start, Token::Reference(parse_reference(body.trim(), owner)?)));
                i += close + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent: e, E, optionally signed.
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber { text: literal.clone() })?;
                tokens.push((start, Token::Number(value)));
            }
            other => return Err(ExpressionError::UnexpectedChar { ch: other, pos: i }),
        }
    }

    Ok(tokens)
}

fn parse_reference(body: &str, owner: &FeatureId) -> Result<ParameterKey, ExpressionError> {
    if body.contains(':') {
        return ParameterKey::parse(body).ok_or_else(|| ExpressionError::InvalidReference {
            text: body.to_string(),
        });
    }
    if body.is_empty() {
        return Err(ExpressionError::InvalidReference {
            text: body.to_string(),
        });
    }
    Ok(ParameterKey::new(owner.clone(), body))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        t
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(0)
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let pos = self.offset();
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Reference(key)) => Ok(Expr::Reference(key)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(_) => Err(ExpressionError::UnexpectedToken { pos }),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(_) => Err(ExpressionError::UnexpectedToken { pos }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

/// Parse `text`. Bare `{name}` references bind to `owner`.
pub fn parse(text: &str, owner: &FeatureId) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(text, owner)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(ExpressionError::UnexpectedToken {
            pos: parser.offset(),
        });
    }
    Ok(expr)
}

/// Evaluate the expression attached to `owner`.
pub fn evaluate(
    text: &str,
    owner: &ParameterKey,
    lookup: &dyn ParameterLookup,
) -> Result<f64, ExpressionError> {
    let mut stack = vec![owner.clone()];
    let value = evaluate_in(text, &owner.feature_id, lookup, &mut stack)?;
    if !value.is_finite() {
        return Err(ExpressionError::NotFinite);
    }
    Ok(value)
}

fn evaluate_in(
    text: &str,
    feature: &FeatureId,
    lookup: &dyn ParameterLookup,
    stack: &mut Vec<ParameterKey>,
) -> Result<f64, ExpressionError> {
    let expr = parse(text, feature)?;
    expr.evaluate(&mut |key| resolve(key, lookup, stack))
}

fn resolve(
    key: &ParameterKey,
    lookup: &dyn ParameterLookup,
    stack: &mut Vec<ParameterKey>,
) -> Result<f64, ExpressionError> {
    if stack.contains(key) {
        let mut chain: Vec<String> = stack.iter().map(|k| k.to_string()).collect();
        chain.push(key.to_string());
        return Err(ExpressionError::CircularReference {
            chain: chain.join(" -> "),
        });
    }
    let (value, expression) = lookup
        .lookup(key)
        .ok_or_else(|| ExpressionError::UnknownReference {
            key: key.to_string(),
        })?;
    match expression {
        None => Ok(value),
        Some(text) => {
            stack.push(key.clone());
            let result = evaluate_in(text, &key.feature_id, lookup, stack);
            stack.pop();
            result
        }
    }
}
