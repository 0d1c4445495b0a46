// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Lexer and Pratt parser for the expression language.
//!
//! The grammar is intentionally small: literals, identifier paths with
//! `.field` / `[index]` accessors, arithmetic, comparison, logical
//! operators, and calls into the fixed function registry. Arbitrary code
//! execution is not expressible.

use crate::error::{FlowError, Result};
use serde_json::Value;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal string/number/boolean/null.
    Literal(Value),
    /// Scope reference head, e.g. `env` or `steps`.
    Ident(String),
    /// `.field` accessor.
    Field(Box<Expr>, String),
    /// `[index]` accessor; the index is itself an expression.
    Index(Box<Expr>, Box<Expr>),
    /// Prefix operator application.
    Unary(UnaryOp, Box<Expr>),
    /// Infix operator application.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Registered function call; dotted names like `hash.sha256` allowed.
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

fn syntax(msg: impl Into<String>) -> FlowError {
    FlowError::InvalidDefinition(format!("expression syntax error: {}", msg.into()))
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' => {
                let mut number = String::new();
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        number.push(d);
                        chars.next();
                    } else if d == '.' {
                        // Lookahead: `1.field` is an accessor, `1.5` a float.
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().map(|n| n.is_ascii_digit()).unwrap_or(false) {
                            is_float = true;
                            number.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                if is_float {
                    let f: f64 = number
                        .parse()
                        .map_err(|_| syntax(format!("invalid number '{number}'")))?;
                    tokens.push(Token::Float(f));
                } else {
                    let i: i64 = number
                        .parse()
                        .map_err(|_| syntax(format!("invalid number '{number}'")))?;
                    tokens.push(Token::Int(i));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(d) = chars.next() {
                    if d == '\\' {
                        match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        }
                    } else if d == quote {
                        closed = true;
                        break;
                    } else {
                        s.push(d);
                    }
                }
                if !closed {
                    return Err(syntax("unterminated string literal"));
                }
                tokens.push(Token::Str(s));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err(syntax("single '=' is not an operator, use '=='"));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(syntax("single '&' is not an operator, use '&&'"));
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::OrOr);
                } else {
                    return Err(syntax("single '|' is not an operator, use '||'"));
                }
            }
            other => return Err(syntax(format!("unexpected character '{other}'"))),
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, context: &str) -> Result<()> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            Some(t) => Err(syntax(format!("expected {context}, found {t:?}"))),
            None => Err(syntax(format!("expected {context}, found end of input"))),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let (op, bp) = match self.peek() {
                Some(Token::OrOr) => (BinaryOp::Or, 1),
                Some(Token::AndAnd) => (BinaryOp::And, 2),
                Some(Token::EqEq) => (BinaryOp::Eq, 3),
                Some(Token::NotEq) => (BinaryOp::Ne, 3),
                Some(Token::Lt) => (BinaryOp::Lt, 3),
                Some(Token::Le) => (BinaryOp::Le, 3),
                Some(Token::Gt) => (BinaryOp::Gt, 3),
                Some(Token::Ge) => (BinaryOp::Ge, 3),
                Some(Token::Plus) => (BinaryOp::Add, 4),
                Some(Token::Minus) => (BinaryOp::Sub, 4),
                Some(Token::Star) => (BinaryOp::Mul, 5),
                Some(Token::Slash) => (BinaryOp::Div, 5),
                Some(Token::Percent) => (BinaryOp::Mod, 5),
                _ => break,
            };
            if bp < min_bp {
                break;
            }
            self.next();
            let rhs = self.parse_expr(bp + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        let token = self.next().ok_or_else(|| syntax("unexpected end of input"))?;
        let expr = match token {
            Token::Int(i) => Expr::Literal(Value::from(i)),
            Token::Float(f) => Expr::Literal(
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Ident(name) => Expr::Ident(name),
            Token::Bang => {
                let operand = self.parse_expr(6)?;
                Expr::Unary(UnaryOp::Not, Box::new(operand))
            }
            Token::Minus => {
                let operand = self.parse_expr(6)?;
                Expr::Unary(UnaryOp::Neg, Box::new(operand))
            }
            Token::LParen => {
                let inner = self.parse_expr(0)?;
                self.expect(&Token::RParen, "')'")?;
                inner
            }
            other => return Err(syntax(format!("unexpected token {other:?}"))),
        };
        self.parse_postfix(expr)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(syntax(format!(
                                "expected field name after '.', found {other:?}"
                            )))
                        }
                    };
                    expr = Expr::Field(Box::new(expr), name);
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.parse_expr(0)?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::LParen) => {
                    let name = ident_path(&expr).ok_or_else(|| {
                        syntax("only registered functions can be called")
                    })?;
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Token::RParen, "')' after call arguments")?;
                    expr = Expr::Call(name, args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }
}

/// Collapses an `Ident`/`Field` chain into a dotted function name.
fn ident_path(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Ident(name) => Some(name.clone()),
        Expr::Field(base, name) => ident_path(base).map(|b| format!("{b}.{name}")),
        _ => None,
    }
}

/// Parses a single expression (the interior of `{{ … }}`).
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(syntax("empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(expr)
}
