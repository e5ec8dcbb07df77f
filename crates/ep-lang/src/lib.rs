#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ep_value::{Labels, Number, Point, Results, Scalar, Series, Value, ValueKind, Vars};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LangError {
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unterminated string literal starting at position {pos}")]
    UnterminatedString { pos: usize },
    #[error("incomplete variable reference at position {pos}")]
    BadVariable { pos: usize },
    #[error("invalid number '{text}' at position {pos}")]
    InvalidNumber { text: String, pos: usize },
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    ArgumentCount {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("function '{name}' argument {index} expects {expected}, got {got}")]
    ArgumentType {
        name: String,
        index: usize,
        expected: ReturnKind,
        got: ReturnKind,
    },
    #[error("parse error at position {pos}: {msg}")]
    Unexpected { pos: usize, msg: String },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

// ── Lexer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    Str,
    Ident,
    Var,
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
    pub text: String,
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn simple(&mut self, kind: TokenKind, len: usize) -> Token {
        let pos = self.pos;
        let text: String = self.chars[pos..pos + len].iter().collect();
        self.pos += len;
        Token { kind, pos, text }
    }

    fn scan_number(&mut self) -> Token {
        let start = self.pos;
        let is_hex = self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X'));
        if is_hex {
            self.pos += 2;
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else if is_hex && c.is_ascii_hexdigit() {
                self.pos += 1;
            } else if !is_hex && (c == 'e' || c == 'E') {
                self.pos += 1;
                if matches!(self.peek(), Some('+' | '-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Number,
            pos: start,
            text: self.chars[start..self.pos].iter().collect(),
        }
    }

    fn scan_string(&mut self) -> Result<Token, LangError> {
        let start = self.pos;
        self.pos += 1;
        let body_start = self.pos;
        while let Some(c) = self.peek() {
            if c == '"' {
                let text: String = self.chars[body_start..self.pos].iter().collect();
                self.pos += 1;
                return Ok(Token {
                    kind: TokenKind::Str,
                    pos: start,
                    text,
                });
            }
            self.pos += 1;
        }
        Err(LangError::UnterminatedString { pos: start })
    }

    fn scan_var(&mut self) -> Result<Token, LangError> {
        let start = self.pos;
        self.pos += 1;
        if self.peek() == Some('{') {
            self.pos += 1;
            let body_start = self.pos;
            while let Some(c) = self.peek() {
                if c == '}' {
                    if self.pos == body_start {
                        return Err(LangError::BadVariable { pos: start });
                    }
                    let text: String = self.chars[body_start..self.pos].iter().collect();
                    self.pos += 1;
                    return Ok(Token {
                        kind: TokenKind::Var,
                        pos: start,
                        text,
                    });
                }
                self.pos += 1;
            }
            return Err(LangError::BadVariable { pos: start });
        }

        let body_start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == body_start {
            return Err(LangError::BadVariable { pos: start });
        }
        Ok(Token {
            kind: TokenKind::Var,
            pos: start,
            text: self.chars[body_start..self.pos].iter().collect(),
        })
    }

    fn scan_ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Ident,
            pos: start,
            text: self.chars[start..self.pos].iter().collect(),
        }
    }
}

/// Tokenize an expression string. The scan is eager and pull-based; a
/// failed parse simply drops the token vector, there is no producer to
/// shut down.
pub fn lex(input: &str) -> Result<Vec<Token>, LangError> {
    let mut scanner = Scanner::new(input);
    let mut tokens = Vec::new();

    while let Some(c) = scanner.peek() {
        let token = match c {
            _ if c.is_whitespace() => {
                scanner.pos += 1;
                continue;
            }
            _ if c.is_ascii_digit() => scanner.scan_number(),
            '.' if scanner.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => scanner.scan_number(),
            '"' => scanner.scan_string()?,
            '$' => scanner.scan_var()?,
            _ if c.is_ascii_alphabetic() || c == '_' => scanner.scan_ident(),
            '(' => scanner.simple(TokenKind::LParen, 1),
            ')' => scanner.simple(TokenKind::RParen, 1),
            ',' => scanner.simple(TokenKind::Comma, 1),
            '+' => scanner.simple(TokenKind::Plus, 1),
            '-' => scanner.simple(TokenKind::Minus, 1),
            '/' => scanner.simple(TokenKind::Slash, 1),
            '%' => scanner.simple(TokenKind::Percent, 1),
            '*' => {
                if scanner.peek_at(1) == Some('*') {
                    scanner.simple(TokenKind::Pow, 2)
                } else {
                    scanner.simple(TokenKind::Star, 1)
                }
            }
            '!' => {
                if scanner.peek_at(1) == Some('=') {
                    scanner.simple(TokenKind::Neq, 2)
                } else {
                    scanner.simple(TokenKind::Not, 1)
                }
            }
            '>' => {
                if scanner.peek_at(1) == Some('=') {
                    scanner.simple(TokenKind::Gte, 2)
                } else {
                    scanner.simple(TokenKind::Gt, 1)
                }
            }
            '<' => {
                if scanner.peek_at(1) == Some('=') {
                    scanner.simple(TokenKind::Lte, 2)
                } else {
                    scanner.simple(TokenKind::Lt, 1)
                }
            }
            '=' => {
                if scanner.peek_at(1) == Some('=') {
                    scanner.simple(TokenKind::Eq, 2)
                } else {
                    return Err(LangError::UnexpectedChar {
                        ch: '=',
                        pos: scanner.pos,
                    });
                }
            }
            '&' => {
                if scanner.peek_at(1) == Some('&') {
                    scanner.simple(TokenKind::And, 2)
                } else {
                    return Err(LangError::UnexpectedChar {
                        ch: '&',
                        pos: scanner.pos,
                    });
                }
            }
            '|' => {
                if scanner.peek_at(1) == Some('|') {
                    scanner.simple(TokenKind::Or, 2)
                } else {
                    return Err(LangError::UnexpectedChar {
                        ch: '|',
                        pos: scanner.pos,
                    });
                }
            }
            other => {
                return Err(LangError::UnexpectedChar {
                    ch: other,
                    pos: scanner.pos,
                });
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

// ── Types and tree ──────────────────────────────────────────────────────

/// Static type of a tree node, used for compile-time argument checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Str,
    Scalar,
    NumberSet,
    SeriesSet,
    Variant,
    NoData,
    Table,
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Str => "string",
            Self::Scalar => "scalar",
            Self::NumberSet => "number set",
            Self::SeriesSet => "series set",
            Self::Variant => "variant set",
            Self::NoData => "no data",
            Self::Table => "table data",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "**",
        };
        f.write_str(text)
    }
}

impl BinaryOp {
    /// Operator semantics over present (non-null) floats. `||` and `&&`
    /// short-circuit on the left operand before the NaN check; every
    /// other operator yields NaN when either operand is NaN. Division by
    /// zero follows IEEE-754.
    #[must_use]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Or => {
                if a != 0.0 {
                    1.0
                } else if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else if b != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::And => {
                if a == 0.0 {
                    0.0
                } else if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else if b == 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
            Self::Gt => compare(a, b, |x, y| x > y),
            Self::Lt => compare(a, b, |x, y| x < y),
            Self::Gte => compare(a, b, |x, y| x >= y),
            Self::Lte => compare(a, b, |x, y| x <= y),
            Self::Eq => compare(a, b, |x, y| x == y),
            Self::Neq => compare(a, b, |x, y| x != y),
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Mod => a % b,
            Self::Pow => {
                // powf(0.0) would swallow NaN operands per IEEE-754.
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.powf(b)
                }
            }
        }
    }
}

fn compare(a: f64, b: f64, f: impl Fn(f64, f64) -> bool) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if f(a, b) {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone)]
pub enum ExprNode {
    Scalar {
        value: f64,
    },
    Str {
        value: String,
    },
    Var {
        name: String,
    },
    Unary {
        op: UnaryOp,
        arg: Box<ExprNode>,
    },
    Binary {
        op: BinaryOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Func {
        name: String,
        def: FuncDef,
        ret: ReturnKind,
        args: Vec<ExprNode>,
    },
}

impl ExprNode {
    /// Static type of this node. Variables resolve at runtime and are
    /// typed as series sets until then; binary results depend on their
    /// operands and stay variant.
    #[must_use]
    pub fn return_kind(&self) -> ReturnKind {
        match self {
            Self::Scalar { .. } => ReturnKind::Scalar,
            Self::Str { .. } => ReturnKind::Str,
            Self::Var { .. } => ReturnKind::SeriesSet,
            Self::Unary { arg, .. } => arg.return_kind(),
            Self::Binary { .. } => ReturnKind::Variant,
            Self::Func { ret, .. } => *ret,
        }
    }
}

// ── Function table ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum FuncArg {
    Values(Results),
    Str(String),
}

pub type FuncImpl = Arc<dyn Fn(&[FuncArg]) -> Result<Results, EvalError> + Send + Sync>;

#[derive(Clone)]
pub struct FuncDef {
    pub arg_kinds: Vec<ReturnKind>,
    pub ret: ReturnKind,
    imp: FuncImpl,
}

impl FuncDef {
    pub fn new(
        arg_kinds: Vec<ReturnKind>,
        ret: ReturnKind,
        imp: impl Fn(&[FuncArg]) -> Result<Results, EvalError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            arg_kinds,
            ret,
            imp: Arc::new(imp),
        }
    }

    fn call(&self, args: &[FuncArg]) -> Result<Results, EvalError> {
        (self.imp)(args)
    }
}

impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncDef")
            .field("arg_kinds", &self.arg_kinds)
            .field("ret", &self.ret)
            .finish_non_exhaustive()
    }
}

/// Explicit function registry passed into the parser. There is no global
/// builtin table; a service owns one of these and may extend it.
#[derive(Clone)]
pub struct Functions {
    defs: BTreeMap<String, FuncDef>,
}

impl Functions {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            defs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn builtin() -> Self {
        let mut functions = Self::empty();
        functions.register("abs", map_fn("abs", f64::abs));
        functions.register("log", map_fn("log", f64::ln));
        functions.register("round", map_fn("round", f64::round));
        functions.register("ceil", map_fn("ceil", f64::ceil));
        functions.register("floor", map_fn("floor", f64::floor));
        functions.register(
            "is_nan",
            predicate_fn("is_nan", |v| {
                v.map(|x| if x.is_nan() { 1.0 } else { 0.0 })
            }),
        );
        functions.register(
            "is_null",
            predicate_fn("is_null", |v| {
                Some(if v.is_none() { 1.0 } else { 0.0 })
            }),
        );
        functions.register(
            "is_number",
            predicate_fn("is_number", |v| {
                Some(match v {
                    Some(x) if x.is_finite() => 1.0,
                    _ => 0.0,
                })
            }),
        );
        functions.register("nan", const_fn(Some(f64::NAN)));
        functions.register("inf", const_fn(Some(f64::INFINITY)));
        functions.register("infn", const_fn(Some(f64::NEG_INFINITY)));
        functions.register("null", const_fn(None));
        functions
    }

    pub fn register(&mut self, name: impl Into<String>, def: FuncDef) {
        self.defs.insert(name.into(), def);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FuncDef> {
        self.defs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(String::as_str)
    }
}

impl Default for Functions {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for Functions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Functions")
            .field("names", &self.defs.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn map_fn(name: &'static str, f: fn(f64) -> f64) -> FuncDef {
    FuncDef::new(
        vec![ReturnKind::Variant],
        ReturnKind::Variant,
        move |args| variant_map(name, args, &|v: Option<f64>| v.map(f)),
    )
}

fn predicate_fn(name: &'static str, f: fn(Option<f64>) -> Option<f64>) -> FuncDef {
    FuncDef::new(
        vec![ReturnKind::Variant],
        ReturnKind::Variant,
        move |args| variant_map(name, args, &f),
    )
}

fn const_fn(value: Option<f64>) -> FuncDef {
    FuncDef::new(Vec::new(), ReturnKind::Scalar, move |_args| {
        Ok(Results::new(vec![Value::Scalar(Scalar::new(value))]))
    })
}

fn variant_map(
    name: &'static str,
    args: &[FuncArg],
    f: &dyn Fn(Option<f64>) -> Option<f64>,
) -> Result<Results, EvalError> {
    let Some(FuncArg::Values(results)) = args.first() else {
        return Err(EvalError::BadFunctionArgument {
            name: name.to_owned(),
        });
    };

    let mut out = Vec::with_capacity(results.values.len());
    for value in &results.values {
        match value {
            Value::Scalar(s) => out.push(Value::Scalar(Scalar::new(f(s.value)))),
            Value::Number(n) => {
                let mut mapped = n.clone();
                mapped.value = f(n.value);
                out.push(Value::Number(mapped));
            }
            Value::Series(s) => {
                let mut mapped = s.clone();
                for point in &mut mapped.points {
                    point.value = f(point.value);
                }
                out.push(Value::Series(mapped));
            }
            Value::NoData(nd) => out.push(Value::NoData(nd.clone())),
            Value::Table(_) => {
                return Err(EvalError::UnsupportedFunctionInput {
                    name: name.to_owned(),
                    kind: ValueKind::Table,
                });
            }
        }
    }
    Ok(Results::new(out))
}

// ── Parser ──────────────────────────────────────────────────────────────

/// A parsed expression: the tree plus every variable reference in order
/// of appearance (duplicates included).
#[derive(Debug, Clone)]
pub struct Expr {
    root: ExprNode,
    var_names: Vec<String>,
}

impl Expr {
    /// Parse and type-check an expression against a function registry.
    pub fn parse(input: &str, functions: &Functions) -> Result<Self, LangError> {
        let tokens = lex(input)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            functions,
            var_names: Vec::new(),
        };
        let root = parser.parse_or()?;
        if let Some(trailing) = parser.tokens.get(parser.pos) {
            return Err(LangError::Unexpected {
                pos: trailing.pos,
                msg: format!("unexpected token '{}' after expression", trailing.text),
            });
        }
        Ok(Self {
            root,
            var_names: parser.var_names,
        })
    }

    #[must_use]
    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    #[must_use]
    pub fn root(&self) -> &ExprNode {
        &self.root
    }

    /// Walk the tree against a variable binding.
    pub fn execute(&self, vars: &Vars) -> Result<Results, EvalError> {
        walk(&self.root, vars)
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    functions: &'a Functions,
    var_names: Vec<String>,
}

impl Parser<'_> {
    fn at(&self, kind: TokenKind) -> bool {
        self.tokens.get(self.pos).is_some_and(|t| t.kind == kind)
    }

    fn parse_or(&mut self) -> Result<ExprNode, LangError> {
        let mut left = self.parse_and()?;
        while self.at(TokenKind::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprNode, LangError> {
        let mut left = self.parse_comparison()?;
        while self.at(TokenKind::And) {
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<ExprNode, LangError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.tokens.get(self.pos).map(|t| t.kind) {
                Some(TokenKind::Gt) => BinaryOp::Gt,
                Some(TokenKind::Lt) => BinaryOp::Lt,
                Some(TokenKind::Gte) => BinaryOp::Gte,
                Some(TokenKind::Lte) => BinaryOp::Lte,
                Some(TokenKind::Eq) => BinaryOp::Eq,
                Some(TokenKind::Neq) => BinaryOp::Neq,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<ExprNode, LangError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.tokens.get(self.pos).map(|t| t.kind) {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<ExprNode, LangError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.tokens.get(self.pos).map(|t| t.kind) {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_power()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<ExprNode, LangError> {
        let mut left = self.parse_factor()?;
        while self.at(TokenKind::Pow) {
            self.pos += 1;
            let right = self.parse_factor()?;
            left = binary(BinaryOp::Pow, left, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<ExprNode, LangError> {
        if self.at(TokenKind::Not) {
            self.pos += 1;
            let arg = self.parse_factor()?;
            return Ok(ExprNode::Unary {
                op: UnaryOp::Not,
                arg: Box::new(arg),
            });
        }
        if self.at(TokenKind::Minus) {
            self.pos += 1;
            let arg = self.parse_factor()?;
            return Ok(ExprNode::Unary {
                op: UnaryOp::Neg,
                arg: Box::new(arg),
            });
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<ExprNode, LangError> {
        let Some(token) = self.tokens.get(self.pos) else {
            return Err(LangError::UnexpectedEnd);
        };

        match token.kind {
            TokenKind::Number => {
                let value = parse_number_literal(&token.text, token.pos)?;
                self.pos += 1;
                Ok(ExprNode::Scalar { value })
            }
            TokenKind::Str => {
                let value = token.text.clone();
                self.pos += 1;
                Ok(ExprNode::Str { value })
            }
            TokenKind::Var => {
                let name = token.text.clone();
                self.pos += 1;
                self.var_names.push(name.clone());
                Ok(ExprNode::Var { name })
            }
            TokenKind::LParen => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if !self.at(TokenKind::RParen) {
                    return Err(LangError::Unexpected {
                        pos: token.pos,
                        msg: "expected closing ')'".to_owned(),
                    });
                }
                self.pos += 1;
                Ok(inner)
            }
            TokenKind::Ident => self.parse_func_call(),
            _ => Err(LangError::Unexpected {
                pos: token.pos,
                msg: format!("unexpected token '{}'", token.text),
            }),
        }
    }

    fn parse_func_call(&mut self) -> Result<ExprNode, LangError> {
        let name_token = &self.tokens[self.pos];
        let name = name_token.text.clone();
        let name_pos = name_token.pos;
        self.pos += 1;

        if !self.at(TokenKind::LParen) {
            return Err(LangError::Unexpected {
                pos: name_pos,
                msg: format!("expected '(' after function name '{name}'"),
            });
        }
        self.pos += 1;

        let mut args = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.at(TokenKind::Comma) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
        }
        if !self.at(TokenKind::RParen) {
            return Err(LangError::Unexpected {
                pos: name_pos,
                msg: format!("expected closing ')' for call to '{name}'"),
            });
        }
        self.pos += 1;

        let def = self
            .functions
            .get(&name)
            .ok_or_else(|| LangError::UnknownFunction { name: name.clone() })?
            .clone();

        if def.arg_kinds.len() != args.len() {
            return Err(LangError::ArgumentCount {
                name,
                expected: def.arg_kinds.len(),
                got: args.len(),
            });
        }

        let mut ret = def.ret;
        for (index, (arg, expected)) in args.iter().zip(def.arg_kinds.iter()).enumerate() {
            let got = arg.return_kind();
            if !arg_accepted(*expected, got) {
                return Err(LangError::ArgumentType {
                    name,
                    index,
                    expected: *expected,
                    got,
                });
            }
            // Late-bound variant return: the declared variant return
            // becomes whichever concrete kind the first variant argument
            // actually carries.
            if ret == ReturnKind::Variant && *expected == ReturnKind::Variant {
                ret = got;
                if ret == ReturnKind::Variant {
                    ret = def.ret;
                }
            }
        }

        Ok(ExprNode::Func {
            name,
            def,
            ret,
            args,
        })
    }
}

fn binary(op: BinaryOp, left: ExprNode, right: ExprNode) -> ExprNode {
    ExprNode::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn arg_accepted(expected: ReturnKind, got: ReturnKind) -> bool {
    match expected {
        ReturnKind::Variant => matches!(
            got,
            ReturnKind::Scalar | ReturnKind::NumberSet | ReturnKind::SeriesSet | ReturnKind::Variant
        ),
        other => got == other || (got == ReturnKind::Variant && other != ReturnKind::Str),
    }
}

fn parse_number_literal(text: &str, pos: usize) -> Result<f64, LangError> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map(|v| v as f64)
            .map_err(|_| LangError::InvalidNumber {
                text: text.to_owned(),
                pos,
            });
    }
    text.parse::<f64>().map_err(|_| LangError::InvalidNumber {
        text: text.to_owned(),
        pos,
    })
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("could not find variable '{0}' to evaluate expression")]
    UnknownVariable(String),
    #[error("binary operation '{op}' is not supported between {left} and {right}")]
    UnsupportedBinary {
        op: BinaryOp,
        left: ValueKind,
        right: ValueKind,
    },
    #[error("unary operations are not supported for {0}")]
    UnsupportedUnary(ValueKind),
    #[error("function '{name}' does not support {kind} input")]
    UnsupportedFunctionInput { name: String, kind: ValueKind },
    #[error("function '{name}' received a malformed argument")]
    BadFunctionArgument { name: String },
    #[error("string literals are only valid as function arguments")]
    StringOperand,
}

// ── Evaluator ───────────────────────────────────────────────────────────

fn walk(node: &ExprNode, vars: &Vars) -> Result<Results, EvalError> {
    match node {
        ExprNode::Scalar { value } => Ok(Results::new(vec![Value::Scalar(Scalar::new(Some(
            *value,
        )))])),
        ExprNode::Str { .. } => Err(EvalError::StringOperand),
        ExprNode::Var { name } => vars
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        ExprNode::Unary { op, arg } => {
            let results = walk(arg, vars)?;
            apply_unary(*op, results)
        }
        ExprNode::Binary { op, left, right } => {
            let lhs = walk(left, vars)?;
            let rhs = walk(right, vars)?;
            let unions = union(&lhs, &rhs);
            let mut out = Vec::with_capacity(unions.len());
            for u in &unions {
                out.push(binary_union(*op, u)?);
            }
            Ok(Results::new(out))
        }
        ExprNode::Func {
            def, args, name: _, ..
        } => {
            let mut call_args = Vec::with_capacity(args.len());
            for arg in args {
                match arg {
                    ExprNode::Str { value } => call_args.push(FuncArg::Str(value.clone())),
                    other => call_args.push(FuncArg::Values(walk(other, vars)?)),
                }
            }
            def.call(&call_args)
        }
    }
}

fn apply_unary(op: UnaryOp, results: Results) -> Result<Results, EvalError> {
    let mut out = Vec::with_capacity(results.values.len());
    for value in results.values {
        match value {
            Value::Scalar(mut s) => {
                s.value = unary_value(op, s.value);
                out.push(Value::Scalar(s));
            }
            Value::Number(mut n) => {
                n.value = unary_value(op, n.value);
                out.push(Value::Number(n));
            }
            Value::Series(mut s) => {
                for point in &mut s.points {
                    point.value = unary_value(op, point.value);
                }
                out.push(Value::Series(s));
            }
            Value::NoData(nd) => out.push(Value::NoData(nd)),
            Value::Table(_) => return Err(EvalError::UnsupportedUnary(ValueKind::Table)),
        }
    }
    Ok(Results::new(out))
}

fn unary_value(op: UnaryOp, value: Option<f64>) -> Option<f64> {
    value.map(|x| match op {
        UnaryOp::Neg => -x,
        UnaryOp::Not => {
            if x.is_nan() {
                f64::NAN
            } else if x == 0.0 {
                1.0
            } else {
                0.0
            }
        }
    })
}

/// A paired combination of two values and the label set their combined
/// output will carry. Ephemeral, produced per binary operator.
#[derive(Debug, Clone)]
struct Union {
    labels: Labels,
    a: Value,
    b: Value,
}

/// Pair two result sets by label compatibility: exact match, empty side
/// adopts the other, subset adopts the superset. Incompatible pairs are
/// dropped; if that drops everything and both sides are single values,
/// a label-less union is produced anyway so single-value math across
/// datasources stays usable.
fn union(a: &Results, b: &Results) -> Vec<Union> {
    if a.values.is_empty() || b.values.is_empty() {
        return Vec::new();
    }
    if a.values.len() == 1
        && b.values.len() == 1
        && (matches!(a.values[0], Value::NoData(_)) || matches!(b.values[0], Value::NoData(_)))
    {
        return vec![Union {
            labels: Labels::new(),
            a: a.values[0].clone(),
            b: b.values[0].clone(),
        }];
    }

    let mut unions = Vec::new();
    for av in &a.values {
        for bv in &b.values {
            if let Some(labels) = union_labels(av.labels(), bv.labels()) {
                unions.push(Union {
                    labels,
                    a: av.clone(),
                    b: bv.clone(),
                });
            }
        }
    }

    if unions.is_empty() && a.values.len() == 1 && b.values.len() == 1 {
        return vec![Union {
            labels: Labels::new(),
            a: a.values[0].clone(),
            b: b.values[0].clone(),
        }];
    }
    unions
}

fn union_labels(a: &Labels, b: &Labels) -> Option<Labels> {
    if a == b {
        return Some(a.clone());
    }
    if a.is_empty() {
        return Some(b.clone());
    }
    if b.is_empty() {
        return Some(a.clone());
    }
    if b.is_subset_of(a) {
        return Some(a.clone());
    }
    if a.is_subset_of(b) {
        return Some(b.clone());
    }
    None
}

fn binary_union(op: BinaryOp, u: &Union) -> Result<Value, EvalError> {
    match (&u.a, &u.b) {
        (Value::NoData(nd), _) | (_, Value::NoData(nd)) => Ok(Value::NoData(nd.clone())),
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(Scalar::new(nullable_op(
            op, a.value, b.value,
        )))),
        (Value::Scalar(a), Value::Number(b)) => {
            Ok(number_value(&u.labels, nullable_op(op, a.value, b.value)))
        }
        (Value::Number(a), Value::Scalar(b)) => {
            Ok(number_value(&u.labels, nullable_op(op, a.value, b.value)))
        }
        (Value::Number(a), Value::Number(b)) => {
            Ok(number_value(&u.labels, nullable_op(op, a.value, b.value)))
        }
        (Value::Scalar(a), Value::Series(s)) => Ok(series_broadcast(op, &u.labels, s, a.value, true)),
        (Value::Number(a), Value::Series(s)) => Ok(series_broadcast(op, &u.labels, s, a.value, true)),
        (Value::Series(s), Value::Scalar(b)) => {
            Ok(series_broadcast(op, &u.labels, s, b.value, false))
        }
        (Value::Series(s), Value::Number(b)) => {
            Ok(series_broadcast(op, &u.labels, s, b.value, false))
        }
        (Value::Series(x), Value::Series(y)) => Ok(series_pair(op, &u.labels, x, y)),
        _ => Err(EvalError::UnsupportedBinary {
            op,
            left: u.a.kind(),
            right: u.b.kind(),
        }),
    }
}

fn number_value(labels: &Labels, value: Option<f64>) -> Value {
    Value::Number(Number::new(labels.clone(), value))
}

fn series_broadcast(
    op: BinaryOp,
    labels: &Labels,
    series: &Series,
    scalar: Option<f64>,
    scalar_on_left: bool,
) -> Value {
    let points = series
        .points
        .iter()
        .map(|p| Point {
            time: p.time,
            value: if scalar_on_left {
                nullable_op(op, scalar, p.value)
            } else {
                nullable_op(op, p.value, scalar)
            },
        })
        .collect();
    Value::Series(Series::new(labels.clone(), points))
}

/// Pair points by exact UTC timestamp equality; unmatched timestamps are
/// dropped, there is no interpolation.
fn series_pair(op: BinaryOp, labels: &Labels, x: &Series, y: &Series) -> Value {
    let by_time: HashMap<DateTime<Utc>, Option<f64>> =
        y.points.iter().map(|p| (p.time, p.value)).collect();

    let mut points = Vec::new();
    for p in &x.points {
        if let Some(&yv) = by_time.get(&p.time) {
            points.push(Point {
                time: p.time,
                value: nullable_op(op, p.value, yv),
            });
        }
    }
    Value::Series(Series::new(labels.clone(), points))
}

fn nullable_op(op: BinaryOp, a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(op.apply(x, y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use ep_value::{Labels, NoData, Number, Point, Results, Scalar, Series, Value, Vars};

    use super::{EvalError, Expr, Functions, LangError, TokenKind, lex, union};

    fn ts(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(seconds, 0).expect("timestamp")
    }

    fn number(labels: Labels, value: Option<f64>) -> Value {
        Value::Number(Number::new(labels, value))
    }

    fn eval(input: &str, vars: &Vars) -> Results {
        Expr::parse(input, &Functions::builtin())
            .expect("parse")
            .execute(vars)
            .expect("eval")
    }

    fn eval_scalar(input: &str) -> Option<f64> {
        let results = eval(input, &Vars::new());
        assert_eq!(results.values.len(), 1);
        match &results.values[0] {
            Value::Scalar(s) => s.value,
            other => panic!("expected scalar, got {other:?}"),
        }
    }

    #[test]
    fn lex_produces_expected_kinds() {
        let tokens = lex("$A * 2 >= ceil(${my var})").expect("lex");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Var,
                TokenKind::Star,
                TokenKind::Number,
                TokenKind::Gte,
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::Var,
                TokenKind::RParen,
            ]
        );
        assert_eq!(tokens[0].text, "A");
        assert_eq!(tokens[6].text, "my var");
    }

    #[test]
    fn lex_rejects_malformed_input() {
        assert!(matches!(
            lex("\"abc").expect_err("must fail"),
            LangError::UnterminatedString { pos: 0 }
        ));
        assert!(matches!(
            lex("${}").expect_err("must fail"),
            LangError::BadVariable { pos: 0 }
        ));
        assert!(matches!(
            lex("$ + 1").expect_err("must fail"),
            LangError::BadVariable { pos: 0 }
        ));
        assert!(matches!(
            lex("1 & 2").expect_err("must fail"),
            LangError::UnexpectedChar { ch: '&', .. }
        ));
        assert!(matches!(
            lex("1 @ 2").expect_err("must fail"),
            LangError::UnexpectedChar { ch: '@', .. }
        ));
    }

    #[test]
    fn precedence_binds_mul_over_add() {
        assert_eq!(eval_scalar("1 + 2 * 3"), Some(7.0));
        assert_eq!(eval_scalar("(1 + 2) * 3"), Some(9.0));
    }

    #[test]
    fn power_is_left_associative() {
        assert_eq!(eval_scalar("2 ** 3 ** 2"), Some(64.0));
    }

    #[test]
    fn unary_not_and_negation() {
        assert_eq!(eval_scalar("!0"), Some(1.0));
        assert_eq!(eval_scalar("!3"), Some(0.0));
        assert_eq!(eval_scalar("-(2 + 1)"), Some(-3.0));
        assert_eq!(eval_scalar("-2 ** 2"), Some(4.0));
    }

    #[test]
    fn hex_and_exponent_literals_parse() {
        assert_eq!(eval_scalar("0x10"), Some(16.0));
        assert_eq!(eval_scalar("1.5e2"), Some(150.0));
    }

    #[test]
    fn invalid_number_is_a_parse_error() {
        let err = Expr::parse("1.2.3", &Functions::builtin()).expect_err("must fail");
        assert!(matches!(err, LangError::InvalidNumber { .. }));
    }

    #[test]
    fn division_by_zero_yields_infinity() {
        assert_eq!(eval_scalar("1 / 0"), Some(f64::INFINITY));
        assert_eq!(eval_scalar("-1 / 0"), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn nan_propagates_through_arithmetic_and_comparison() {
        for input in [
            "nan() + 1",
            "1 - nan()",
            "nan() * 2",
            "nan() / 2",
            "nan() % 2",
            "nan() ** 0",
            "nan() > 1",
            "1 == nan()",
        ] {
            let value = eval_scalar(input).expect("present value");
            assert!(value.is_nan(), "{input} should be NaN");
        }
    }

    #[test]
    fn logical_operators_short_circuit_before_nan_check() {
        // NaN != 0 so `||` short-circuits true; `&&` sees non-zero left
        // and then hits the NaN check.
        assert_eq!(eval_scalar("nan() || 0"), Some(1.0));
        assert_eq!(eval_scalar("0 && nan()"), Some(0.0));
        assert!(eval_scalar("1 && nan()").expect("present").is_nan());
        assert!(eval_scalar("0 || nan()").expect("present").is_nan());
    }

    #[test]
    fn null_propagates_through_every_operator() {
        for input in ["null() + 1", "null() > 1", "null() && 1", "!null()", "-null()"] {
            let results = eval(input, &Vars::new());
            match &results.values[0] {
                Value::Scalar(s) => assert_eq!(s.value, None, "{input} should be null"),
                other => panic!("expected scalar, got {other:?}"),
            }
        }
    }

    #[test]
    fn builtin_functions_map_elementwise() {
        assert_eq!(eval_scalar("abs(0 - 3)"), Some(3.0));
        assert_eq!(eval_scalar("ceil(1.2)"), Some(2.0));
        assert_eq!(eval_scalar("floor(1.8)"), Some(1.0));
        assert_eq!(eval_scalar("round(2.5)"), Some(3.0));
        assert_eq!(eval_scalar("is_null(null())"), Some(1.0));
        assert_eq!(eval_scalar("is_null(1)"), Some(0.0));
        assert_eq!(eval_scalar("is_nan(nan())"), Some(1.0));
        assert_eq!(eval_scalar("is_number(inf())"), Some(0.0));
        assert_eq!(eval_scalar("is_number(2)"), Some(1.0));
    }

    #[test]
    fn unknown_function_and_arity_are_parse_errors() {
        assert!(matches!(
            Expr::parse("bogus(1)", &Functions::builtin()).expect_err("must fail"),
            LangError::UnknownFunction { name } if name == "bogus"
        ));
        assert!(matches!(
            Expr::parse("abs(1, 2)", &Functions::builtin()).expect_err("must fail"),
            LangError::ArgumentCount { expected: 1, got: 2, .. }
        ));
    }

    #[test]
    fn string_argument_rejected_for_variant_parameter() {
        let err = Expr::parse("abs(\"nope\")", &Functions::builtin()).expect_err("must fail");
        assert!(matches!(err, LangError::ArgumentType { index: 0, .. }));
    }

    #[test]
    fn var_names_record_every_occurrence_in_order() {
        let expr = Expr::parse("$A + $B * $A", &Functions::builtin()).expect("parse");
        assert_eq!(expr.var_names(), ["A", "B", "A"]);
    }

    #[test]
    fn unknown_variable_is_an_eval_error() {
        let expr = Expr::parse("$missing + 1", &Functions::builtin()).expect("parse");
        let err = expr.execute(&Vars::new()).expect_err("must fail");
        assert_eq!(err, EvalError::UnknownVariable("missing".to_owned()));
    }

    #[test]
    fn union_on_equal_labels_yields_one_union_per_pair() {
        let labels = Labels::from_pairs([("host", "h1")]);
        let a = Results::new(vec![number(labels.clone(), Some(1.0))]);
        let b = Results::new(vec![number(labels.clone(), Some(2.0))]);

        let unions = union(&a, &b);
        assert_eq!(unions.len(), 1);
        assert_eq!(unions[0].labels, labels);
    }

    #[test]
    fn union_adopts_superset_labels() {
        let small = Labels::from_pairs([("host", "h1")]);
        let big = Labels::from_pairs([("host", "h1"), ("zone", "eu")]);
        let a = Results::new(vec![
            number(small, Some(1.0)),
            number(Labels::from_pairs([("host", "h2")]), Some(9.0)),
        ]);
        let b = Results::new(vec![number(big.clone(), Some(2.0))]);

        let unions = union(&a, &b);
        assert_eq!(unions.len(), 1);
        assert_eq!(unions[0].labels, big);
    }

    #[test]
    fn union_drops_incompatible_pairs_among_many() {
        let a = Results::new(vec![
            number(Labels::from_pairs([("host", "h1")]), Some(1.0)),
            number(Labels::from_pairs([("host", "h2")]), Some(2.0)),
        ]);
        let b = Results::new(vec![
            number(Labels::from_pairs([("host", "h1")]), Some(10.0)),
            number(Labels::from_pairs([("host", "h3")]), Some(30.0)),
        ]);

        let unions = union(&a, &b);
        assert_eq!(unions.len(), 1);
        assert_eq!(unions[0].labels, Labels::from_pairs([("host", "h1")]));
    }

    #[test]
    fn union_single_value_fallback_strips_labels() {
        let a = Results::new(vec![number(Labels::from_pairs([("host", "h1")]), Some(1.0))]);
        let b = Results::new(vec![number(Labels::from_pairs([("zone", "eu")]), Some(2.0))]);

        let unions = union(&a, &b);
        assert_eq!(unions.len(), 1);
        assert!(unions[0].labels.is_empty());
    }

    #[test]
    fn union_passes_no_data_through() {
        let a = Results::no_data();
        let b = Results::new(vec![number(Labels::new(), Some(2.0))]);
        let unions = union(&a, &b);
        assert_eq!(unions.len(), 1);
        assert!(matches!(unions[0].a, Value::NoData(_)));
    }

    #[test]
    fn binary_with_no_data_side_passes_no_data() {
        let mut vars = Vars::new();
        vars.insert("A".to_owned(), Results::no_data());
        let results = eval("$A + 1", &vars);
        assert_eq!(results.values.len(), 1);
        assert!(matches!(results.values[0], Value::NoData(_)));
    }

    #[test]
    fn scalar_broadcasts_over_series() {
        let labels = Labels::from_pairs([("host", "h1")]);
        let series = Series::new(
            labels.clone(),
            vec![
                Point {
                    time: ts(1),
                    value: Some(2.0),
                },
                Point {
                    time: ts(2),
                    value: None,
                },
            ],
        );
        let mut vars = Vars::new();
        vars.insert("A".to_owned(), Results::new(vec![Value::Series(series)]));

        let results = eval("$A * 2", &vars);
        let Value::Series(out) = &results.values[0] else {
            panic!("expected series");
        };
        assert_eq!(out.labels, labels);
        assert_eq!(out.points[0].value, Some(4.0));
        assert_eq!(out.points[1].value, None);
    }

    #[test]
    fn series_pair_matches_on_exact_timestamps() {
        let labels = Labels::from_pairs([("host", "h1")]);
        let a = Series::new(
            labels.clone(),
            vec![
                Point {
                    time: ts(1),
                    value: Some(1.0),
                },
                Point {
                    time: ts(2),
                    value: Some(2.0),
                },
                Point {
                    time: ts(3),
                    value: Some(3.0),
                },
            ],
        );
        let b = Series::new(
            labels,
            vec![
                Point {
                    time: ts(2),
                    value: Some(10.0),
                },
                Point {
                    time: ts(3),
                    value: None,
                },
                Point {
                    time: ts(4),
                    value: Some(40.0),
                },
            ],
        );
        let mut vars = Vars::new();
        vars.insert("A".to_owned(), Results::new(vec![Value::Series(a)]));
        vars.insert("B".to_owned(), Results::new(vec![Value::Series(b)]));

        let results = eval("$A + $B", &vars);
        let Value::Series(out) = &results.values[0] else {
            panic!("expected series");
        };
        // t=1 and t=4 are unmatched and dropped; t=3 pairs with null.
        assert_eq!(out.points.len(), 2);
        assert_eq!(out.points[0].value, Some(12.0));
        assert_eq!(out.points[1].value, None);
    }

    #[test]
    fn number_scalar_keeps_operand_order() {
        let mut vars = Vars::new();
        vars.insert(
            "A".to_owned(),
            Results::new(vec![number(Labels::new(), Some(10.0))]),
        );
        let results = eval("$A - 4", &vars);
        let Value::Number(out) = &results.values[0] else {
            panic!("expected number");
        };
        assert_eq!(out.value, Some(6.0));

        let results = eval("4 - $A", &vars);
        let Value::Number(out) = &results.values[0] else {
            panic!("expected number");
        };
        assert_eq!(out.value, Some(-6.0));
    }

    #[test]
    fn empty_side_produces_no_unions() {
        let a = Results::new(Vec::new());
        let b = Results::new(vec![Value::NoData(NoData::default())]);
        assert!(union(&a, &b).is_empty());
    }

    #[test]
    fn scalar_constant_evaluates_to_single_scalar() {
        let results = eval("7", &Vars::new());
        assert_eq!(
            results.values,
            vec![Value::Scalar(Scalar::new(Some(7.0)))]
        );
    }
}
