//! Bundled calc expression subset.
//!
//! String calcs are compiled once at graph build and invoked per
//! derivation: tokenizer → Pratt parser → typed [`Expr`] → recursive
//! evaluator over [`Value`] with strict missing propagation. The surface
//! is deliberately small: literals, named input slots, member access,
//! indexing, calls into a fixed builtin table, arithmetic, comparison,
//! boolean logic, and `cond ? a : b`.

use crate::error::{Error, Result};
use crate::value::Value;
use indexmap::IndexMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::iter::Peekable;
use std::rc::Rc;
use std::str::Chars;
use std::sync::Arc;

/// Functions callable from calc expressions.
pub const BUILTINS: &[&str] = &[
    "sum", "count", "avg", "min", "max", "abs", "round", "floor", "ceil", "concat", "coalesce",
    "length", "contains",
];

/// Compiled expression — every operation is a direct enum variant.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Lit),
    /// Named input slot (or `itself`).
    Slot(Arc<str>),
    Member(Box<Expr>, Arc<str>),
    Index(Box<Expr>, Box<Expr>),
    Call(Arc<str>, Vec<Expr>),

    Neg(Box<Expr>),
    Not(Box<Expr>),

    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),

    Eq(Box<Expr>, Box<Expr>),
    Neq(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Gte(Box<Expr>, Box<Expr>),
    Lte(Box<Expr>, Box<Expr>),

    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// Scalar literal embedded in a compiled expression.
#[derive(Debug, Clone)]
pub enum Lit {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
}

impl Lit {
    fn to_value(&self) -> Value {
        match self {
            Lit::Null => Value::Null,
            Lit::Bool(b) => Value::Bool(*b),
            Lit::Int(n) => Value::Int(*n),
            Lit::Float(f) => Value::Float(*f),
            Lit::Str(s) => Value::Str(Rc::from(s.as_ref())),
        }
    }
}

/// A compiled calc plus its source text (kept for debug traces).
#[derive(Debug, Clone)]
pub struct Program {
    pub expr: Expr,
    pub src: Arc<str>,
}

impl Program {
    /// All slot identifiers the expression reads, sorted.
    pub fn free_idents(&self) -> Vec<Arc<str>> {
        let mut out = BTreeSet::new();
        collect_idents(&self.expr, &mut out);
        out.into_iter().collect()
    }
}

fn collect_idents(expr: &Expr, out: &mut BTreeSet<Arc<str>>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Slot(name) => {
            out.insert(Arc::clone(name));
        }
        Expr::Member(base, _) => collect_idents(base, out),
        Expr::Index(base, idx) => {
            collect_idents(base, out);
            collect_idents(idx, out);
        }
        Expr::Call(_, args) => {
            for a in args {
                collect_idents(a, out);
            }
        }
        Expr::Neg(a) | Expr::Not(a) => collect_idents(a, out),
        Expr::Add(a, b)
        | Expr::Sub(a, b)
        | Expr::Mul(a, b)
        | Expr::Div(a, b)
        | Expr::Mod(a, b)
        | Expr::Eq(a, b)
        | Expr::Neq(a, b)
        | Expr::Gt(a, b)
        | Expr::Lt(a, b)
        | Expr::Gte(a, b)
        | Expr::Lte(a, b)
        | Expr::And(a, b)
        | Expr::Or(a, b) => {
            collect_idents(a, out);
            collect_idents(b, out);
        }
        Expr::Ternary(c, a, b) => {
            collect_idents(c, out);
            collect_idents(a, out);
            collect_idents(b, out);
        }
    }
}

/// Compile an expression string.
pub fn compile(src: &str) -> Result<Program> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0, src };
    let expr = parser.parse_expr(0)?;
    if parser.pos < parser.tokens.len() {
        return Err(Error::Parse(format!(
            "trailing input in expression {:?}",
            src
        )));
    }
    Ok(Program {
        expr,
        src: Arc::from(src),
    })
}

// === Tokenizer ===

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
}

fn tokenize(src: &str) -> Result<Vec<Tok>> {
    let mut out = Vec::new();
    let mut chars: Peekable<Chars<'_>> = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => push_one(&mut chars, &mut out, Tok::LParen),
            ')' => push_one(&mut chars, &mut out, Tok::RParen),
            '[' => push_one(&mut chars, &mut out, Tok::LBracket),
            ']' => push_one(&mut chars, &mut out, Tok::RBracket),
            ',' => push_one(&mut chars, &mut out, Tok::Comma),
            '.' => push_one(&mut chars, &mut out, Tok::Dot),
            '?' => push_one(&mut chars, &mut out, Tok::Question),
            ':' => push_one(&mut chars, &mut out, Tok::Colon),
            '+' => push_one(&mut chars, &mut out, Tok::Plus),
            '-' => push_one(&mut chars, &mut out, Tok::Minus),
            '*' => push_one(&mut chars, &mut out, Tok::Star),
            '/' => push_one(&mut chars, &mut out, Tok::Slash),
            '%' => push_one(&mut chars, &mut out, Tok::Percent),
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Tok::EqEq);
                } else {
                    return Err(Error::Parse(format!("stray '=' in expression {:?}", src)));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Tok::NotEq);
                } else {
                    out.push(Tok::Bang);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Tok::Le);
                } else {
                    out.push(Tok::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Tok::Ge);
                } else {
                    out.push(Tok::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    out.push(Tok::AndAnd);
                } else {
                    return Err(Error::Parse(format!("stray '&' in expression {:?}", src)));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    out.push(Tok::OrOr);
                } else {
                    return Err(Error::Parse(format!("stray '|' in expression {:?}", src)));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut escaped = false;
                let mut closed = false;
                for nc in chars.by_ref() {
                    if escaped {
                        s.push(nc);
                        escaped = false;
                    } else if nc == '\\' {
                        escaped = true;
                    } else if nc == quote {
                        closed = true;
                        break;
                    } else {
                        s.push(nc);
                    }
                }
                if !closed {
                    return Err(Error::Parse(format!(
                        "unterminated string in expression {:?}",
                        src
                    )));
                }
                out.push(Tok::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let mut s = String::new();
                let mut is_float = false;
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_digit() {
                        s.push(nc);
                        chars.next();
                    } else if nc == '.' {
                        // member access on an int literal is not supported,
                        // so a dot here always starts a fraction
                        if is_float {
                            break;
                        }
                        is_float = true;
                        s.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let f: f64 = s
                        .parse()
                        .map_err(|_| Error::Parse(format!("invalid number {:?}", s)))?;
                    out.push(Tok::Float(f));
                } else {
                    let n: i64 = s
                        .parse()
                        .map_err(|_| Error::Parse(format!("invalid number {:?}", s)))?;
                    out.push(Tok::Int(n));
                }
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_alphanumeric() || nc == '_' {
                        s.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Tok::Ident(s));
            }
            other => {
                return Err(Error::Parse(format!(
                    "unexpected character {:?} in expression {:?}",
                    other, src
                )))
            }
        }
    }
    Ok(out)
}

fn push_one(chars: &mut Peekable<Chars<'_>>, out: &mut Vec<Tok>, tok: Tok) {
    chars.next();
    out.push(tok);
}

// === Parser ===

struct Parser<'s> {
    tokens: Vec<Tok>,
    pos: usize,
    src: &'s str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Tok) -> Result<()> {
        match self.bump() {
            Some(t) if &t == tok => Ok(()),
            other => Err(Error::Parse(format!(
                "expected {:?}, found {:?} in expression {:?}",
                tok, other, self.src
            ))),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;
        loop {
            let Some(tok) = self.peek() else { break };
            match tok {
                Tok::Dot => {
                    self.pos += 1;
                    match self.bump() {
                        Some(Tok::Ident(name)) => {
                            lhs = Expr::Member(Box::new(lhs), Arc::from(name.as_str()));
                        }
                        other => {
                            return Err(Error::Parse(format!(
                                "expected member name after '.', found {:?} in {:?}",
                                other, self.src
                            )))
                        }
                    }
                }
                Tok::LBracket => {
                    self.pos += 1;
                    let idx = self.parse_expr(0)?;
                    self.expect(&Tok::RBracket)?;
                    lhs = Expr::Index(Box::new(lhs), Box::new(idx));
                }
                Tok::Question if min_bp <= 1 => {
                    self.pos += 1;
                    let then = self.parse_expr(0)?;
                    self.expect(&Tok::Colon)?;
                    let alt = self.parse_expr(1)?;
                    lhs = Expr::Ternary(Box::new(lhs), Box::new(then), Box::new(alt));
                }
                _ => {
                    let Some((l_bp, r_bp)) = binary_bp(tok) else {
                        break;
                    };
                    if l_bp < min_bp {
                        break;
                    }
                    let op = self.bump().expect("peeked");
                    let rhs = self.parse_expr(r_bp)?;
                    lhs = make_binary(&op, lhs, rhs);
                }
            }
        }
        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Tok::Int(n)) => Ok(Expr::Literal(Lit::Int(n))),
            Some(Tok::Float(f)) => Ok(Expr::Literal(Lit::Float(f))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Lit::Str(Arc::from(s.as_str())))),
            Some(Tok::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Lit::Bool(true))),
                "false" => Ok(Expr::Literal(Lit::Bool(false))),
                "null" => Ok(Expr::Literal(Lit::Null)),
                _ => {
                    if self.peek() == Some(&Tok::LParen) {
                        if !BUILTINS.contains(&name.as_str()) {
                            return Err(Error::Parse(format!(
                                "unknown function {:?} in expression {:?}",
                                name, self.src
                            )));
                        }
                        self.pos += 1;
                        let mut args = Vec::new();
                        if self.peek() != Some(&Tok::RParen) {
                            loop {
                                args.push(self.parse_expr(0)?);
                                match self.peek() {
                                    Some(Tok::Comma) => {
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                        }
                        self.expect(&Tok::RParen)?;
                        Ok(Expr::Call(Arc::from(name.as_str()), args))
                    } else {
                        Ok(Expr::Slot(Arc::from(name.as_str())))
                    }
                }
            },
            Some(Tok::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Minus) => Ok(Expr::Neg(Box::new(self.parse_expr(8)?))),
            Some(Tok::Bang) => Ok(Expr::Not(Box::new(self.parse_expr(8)?))),
            other => Err(Error::Parse(format!(
                "unexpected token {:?} in expression {:?}",
                other, self.src
            ))),
        }
    }
}

fn binary_bp(tok: &Tok) -> Option<(u8, u8)> {
    Some(match tok {
        Tok::OrOr => (2, 3),
        Tok::AndAnd => (3, 4),
        Tok::EqEq | Tok::NotEq => (4, 5),
        Tok::Lt | Tok::Gt | Tok::Le | Tok::Ge => (5, 6),
        Tok::Plus | Tok::Minus => (6, 7),
        Tok::Star | Tok::Slash | Tok::Percent => (7, 8),
        _ => return None,
    })
}

fn make_binary(op: &Tok, a: Expr, b: Expr) -> Expr {
    let (a, b) = (Box::new(a), Box::new(b));
    match op {
        Tok::Plus => Expr::Add(a, b),
        Tok::Minus => Expr::Sub(a, b),
        Tok::Star => Expr::Mul(a, b),
        Tok::Slash => Expr::Div(a, b),
        Tok::Percent => Expr::Mod(a, b),
        Tok::EqEq => Expr::Eq(a, b),
        Tok::NotEq => Expr::Neq(a, b),
        Tok::Gt => Expr::Gt(a, b),
        Tok::Lt => Expr::Lt(a, b),
        Tok::Ge => Expr::Gte(a, b),
        Tok::Le => Expr::Lte(a, b),
        Tok::AndAnd => Expr::And(a, b),
        Tok::OrOr => Expr::Or(a, b),
        other => unreachable!("not a binary operator: {:?}", other),
    }
}

// === Evaluator ===

/// Named-slot binding a calc runs against.
pub struct Scope<'a> {
    pub slots: &'a IndexMap<Arc<str>, Value>,
    pub itself: &'a Value,
    pub debug: bool,
}

/// Evaluate a compiled expression. An `Err` means the calc failed and the
/// caller records a tagged missing value; missing operands never error,
/// they propagate.
pub fn eval(expr: &Expr, scope: &Scope) -> std::result::Result<Value, String> {
    match expr {
        Expr::Literal(lit) => Ok(lit.to_value()),
        Expr::Slot(name) => {
            if name.as_ref() == "itself" {
                return Ok(scope.itself.clone());
            }
            Ok(scope
                .slots
                .get(name.as_ref())
                .cloned()
                .unwrap_or_else(Value::missing))
        }
        Expr::Member(base, name) => {
            let base = eval(base, scope)?;
            Ok(member(&base, name, scope.debug))
        }
        Expr::Index(base, idx) => {
            let base = eval(base, scope)?;
            let idx = eval(idx, scope)?;
            Ok(index(&base, &idx, scope.debug))
        }
        Expr::Call(name, args) => {
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                vals.push(eval(a, scope)?);
            }
            call(name, &vals)
        }
        Expr::Neg(a) => {
            let v = eval(a, scope)?;
            match v {
                Value::Missing(_) => Ok(v),
                Value::Int(n) => Ok(Value::Int(-n)),
                Value::Float(f) => Ok(Value::Float(-f)),
                Value::Decimal(d) => Ok(Value::Decimal(-d)),
                other => Err(format!("cannot negate {}", other.display_string())),
            }
        }
        Expr::Not(a) => Ok(Value::Bool(!eval(a, scope)?.truthy())),
        Expr::Add(a, b) => arith('+', eval(a, scope)?, eval(b, scope)?),
        Expr::Sub(a, b) => arith('-', eval(a, scope)?, eval(b, scope)?),
        Expr::Mul(a, b) => arith('*', eval(a, scope)?, eval(b, scope)?),
        Expr::Div(a, b) => arith('/', eval(a, scope)?, eval(b, scope)?),
        Expr::Mod(a, b) => arith('%', eval(a, scope)?, eval(b, scope)?),
        Expr::Eq(a, b) => Ok(Value::Bool(eval(a, scope)? == eval(b, scope)?)),
        Expr::Neq(a, b) => Ok(Value::Bool(eval(a, scope)? != eval(b, scope)?)),
        Expr::Gt(a, b) => compare(eval(a, scope)?, eval(b, scope)?, |o| o == Ordering::Greater),
        Expr::Lt(a, b) => compare(eval(a, scope)?, eval(b, scope)?, |o| o == Ordering::Less),
        Expr::Gte(a, b) => compare(eval(a, scope)?, eval(b, scope)?, |o| o != Ordering::Less),
        Expr::Lte(a, b) => compare(eval(a, scope)?, eval(b, scope)?, |o| o != Ordering::Greater),
        Expr::And(a, b) => {
            let av = eval(a, scope)?;
            if !av.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(eval(b, scope)?)
        }
        Expr::Or(a, b) => {
            let av = eval(a, scope)?;
            if av.truthy() {
                return Ok(av);
            }
            Ok(eval(b, scope)?)
        }
        Expr::Ternary(c, a, b) => {
            if eval(c, scope)?.truthy() {
                eval(a, scope)
            } else {
                eval(b, scope)
            }
        }
    }
}

fn member(base: &Value, name: &str, debug: bool) -> Value {
    match base {
        Value::Missing(reason) => extend_missing(reason, name, debug),
        Value::Object(map) => map
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_else(Value::missing),
        _ => Value::missing(),
    }
}

fn index(base: &Value, idx: &Value, debug: bool) -> Value {
    match (base, idx) {
        (Value::Missing(reason), _) => extend_missing(reason, &idx.display_string(), debug),
        (Value::Array(items), Value::Int(i)) => {
            let items = items.borrow();
            usize::try_from(*i)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or_else(Value::missing)
        }
        (Value::Object(map), Value::Str(key)) => map
            .borrow()
            .get(key.as_ref())
            .cloned()
            .unwrap_or_else(Value::missing),
        _ => Value::missing(),
    }
}

fn extend_missing(reason: &Option<Arc<str>>, accessed: &str, debug: bool) -> Value {
    if !debug {
        return Value::missing();
    }
    let base = reason.as_deref().unwrap_or("missing");
    Value::missing_because(format!("{}.{}", base, accessed))
}

fn arith(op: char, a: Value, b: Value) -> std::result::Result<Value, String> {
    if a.is_missing() {
        return Ok(a);
    }
    if b.is_missing() {
        return Ok(b);
    }
    if op == '+' {
        if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
            return Ok(Value::Str(Rc::from(format!("{}{}", x, y).as_str())));
        }
    }
    if !is_number(&a) || !is_number(&b) {
        return Err(format!(
            "unsupported operands for '{}': {} and {}",
            op,
            a.display_string(),
            b.display_string()
        ));
    }
    if matches!(a, Value::Decimal(_)) || matches!(b, Value::Decimal(_)) {
        let (x, y) = (to_decimal(&a), to_decimal(&b));
        if let (Some(x), Some(y)) = (x, y) {
            return match op {
                '+' => Ok(Value::Decimal(x + y)),
                '-' => Ok(Value::Decimal(x - y)),
                '*' => Ok(Value::Decimal(x * y)),
                '/' if y.is_zero() => Err("division by zero".to_string()),
                '/' => Ok(Value::Decimal(x / y)),
                '%' if y.is_zero() => Err("modulo by zero".to_string()),
                '%' => Ok(Value::Decimal(x % y)),
                _ => unreachable!("not an arithmetic operator: {}", op),
            };
        }
    }
    if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
        match op {
            '+' => return Ok(Value::Int(x.wrapping_add(*y))),
            '-' => return Ok(Value::Int(x.wrapping_sub(*y))),
            '*' => return Ok(Value::Int(x.wrapping_mul(*y))),
            '%' if *y == 0 => return Err("modulo by zero".to_string()),
            '%' => return Ok(Value::Int(x.rem_euclid(*y))),
            _ => {}
        }
    }
    let (x, y) = (a.to_f(), b.to_f());
    match op {
        '+' => Ok(Value::Float(x + y)),
        '-' => Ok(Value::Float(x - y)),
        '*' => Ok(Value::Float(x * y)),
        '/' if y == 0.0 => Err("division by zero".to_string()),
        '/' => Ok(Value::Float(x / y)),
        '%' if y == 0.0 => Err("modulo by zero".to_string()),
        '%' => Ok(Value::Float(x % y)),
        _ => unreachable!("not an arithmetic operator: {}", op),
    }
}

fn is_number(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Float(_) | Value::Decimal(_))
}

fn to_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Decimal(d) => Some(*d),
        Value::Int(n) => Some(Decimal::from(*n)),
        Value::Float(f) => Decimal::from_f64(*f),
        _ => None,
    }
}

fn compare(
    a: Value,
    b: Value,
    pick: fn(Ordering) -> bool,
) -> std::result::Result<Value, String> {
    if a.is_missing() {
        return Ok(a);
    }
    if b.is_missing() {
        return Ok(b);
    }
    let ord = match (&a, &b) {
        (x, y) if is_number(x) && is_number(y) => x.to_f().partial_cmp(&y.to_f()),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (x, y) => Some(x.display_string().cmp(&y.display_string())),
    };
    Ok(ord.map(|o| Value::Bool(pick(o))).unwrap_or_else(Value::missing))
}

fn call(name: &str, args: &[Value]) -> std::result::Result<Value, String> {
    let first = args.first().cloned().unwrap_or_else(Value::missing);
    match name {
        "sum" => fold_numeric(&first, '+', Value::Int(0)),
        "avg" => {
            let total = fold_numeric(&first, '+', Value::Int(0))?;
            if total.is_missing() {
                return Ok(total);
            }
            let n = element_count(&first);
            if n == 0 {
                return Ok(Value::missing());
            }
            arith('/', total, Value::Int(n))
        }
        "count" => Ok(Value::Int(match &first {
            Value::Array(items) => items.borrow().iter().filter(|v| !v.is_missing()).count() as i64,
            Value::Object(map) => map.borrow().len() as i64,
            Value::Missing(_) => 0,
            _ => 1,
        })),
        "min" | "max" => {
            let want_less = name == "min";
            let Value::Array(items) = &first else {
                return Ok(first);
            };
            let items = items.borrow();
            let mut best: Option<Value> = None;
            for v in items.iter() {
                if v.is_missing() {
                    return Ok(v.clone());
                }
                best = Some(match best {
                    None => v.clone(),
                    Some(cur) => {
                        let keep_new = match compare(v.clone(), cur.clone(), |o| {
                            o == Ordering::Less
                        })? {
                            Value::Bool(less) => less == want_less,
                            _ => false,
                        };
                        if keep_new {
                            v.clone()
                        } else {
                            cur
                        }
                    }
                });
            }
            Ok(best.unwrap_or_else(Value::missing))
        }
        "abs" => match first {
            Value::Missing(_) => Ok(first),
            Value::Int(n) => Ok(Value::Int(n.abs())),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            Value::Decimal(d) => Ok(Value::Decimal(d.abs())),
            other => Err(format!("abs of non-number {}", other.display_string())),
        },
        "round" | "floor" | "ceil" => {
            let digits = args.get(1).map(Value::to_i).unwrap_or(0).max(0) as u32;
            round_like(name, first, digits)
        }
        "concat" => {
            let mut out = String::new();
            for v in args {
                if v.is_missing() {
                    return Ok(v.clone());
                }
                out.push_str(&v.display_string());
            }
            Ok(Value::Str(Rc::from(out.as_str())))
        }
        "coalesce" => Ok(args
            .iter()
            .find(|v| !v.is_missing() && !matches!(v, Value::Null))
            .cloned()
            .unwrap_or_else(Value::missing)),
        "length" => Ok(match &first {
            Value::Str(s) => Value::Int(s.chars().count() as i64),
            Value::Array(items) => Value::Int(items.borrow().len() as i64),
            Value::Object(map) => Value::Int(map.borrow().len() as i64),
            Value::Missing(_) => first.clone(),
            _ => Value::missing(),
        }),
        "contains" => {
            let needle = args.get(1).cloned().unwrap_or_else(Value::missing);
            if first.is_missing() || needle.is_missing() {
                return Ok(Value::missing());
            }
            Ok(Value::Bool(match &first {
                Value::Str(s) => s.contains(&needle.display_string()),
                Value::Array(items) => items.borrow().iter().any(|v| *v == needle),
                _ => false,
            }))
        }
        other => Err(format!("unknown function {:?}", other)),
    }
}

fn fold_numeric(value: &Value, op: char, init: Value) -> std::result::Result<Value, String> {
    match value {
        Value::Missing(_) => Ok(value.clone()),
        Value::Array(items) => {
            let items = items.borrow();
            let mut acc = init;
            for v in items.iter() {
                if v.is_missing() {
                    return Ok(v.clone());
                }
                acc = arith(op, acc, v.clone())?;
            }
            Ok(acc)
        }
        scalar => arith(op, init, scalar.clone()),
    }
}

fn element_count(value: &Value) -> i64 {
    match value {
        Value::Array(items) => items.borrow().len() as i64,
        _ => 1,
    }
}

fn round_like(name: &str, value: Value, digits: u32) -> std::result::Result<Value, String> {
    let scale = 10f64.powi(digits as i32);
    match value {
        Value::Missing(_) | Value::Int(_) => Ok(value),
        Value::Float(f) => Ok(Value::Float(match name {
            "round" => (f * scale).round() / scale,
            "floor" => (f * scale).floor() / scale,
            _ => (f * scale).ceil() / scale,
        })),
        Value::Decimal(d) => Ok(Value::Decimal(match name {
            "round" => d.round_dp(digits),
            "floor" => d.floor(),
            _ => d.ceil(),
        })),
        other => Err(format!("{} of non-number {}", name, other.display_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str, slots: &[(&str, Value)]) -> std::result::Result<Value, String> {
        let program = compile(src).expect("compile");
        let slots: IndexMap<Arc<str>, Value> = slots
            .iter()
            .map(|(k, v)| (Arc::from(*k), v.clone()))
            .collect();
        let itself = Value::new_object();
        eval(
            &program.expr,
            &Scope {
                slots: &slots,
                itself: &itself,
                debug: false,
            },
        )
    }

    #[test]
    fn precedence_and_parens() {
        assert_eq!(run("1 + 2 * 3", &[]).unwrap(), Value::Int(7));
        assert_eq!(run("(1 + 2) * 3", &[]).unwrap(), Value::Int(9));
        assert_eq!(run("-2 * 3", &[]).unwrap(), Value::Int(-6));
        assert_eq!(run("1 + 2 > 2 && true", &[]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn slots_and_members() {
        let obj = Value::from_json(&serde_json::json!({"a": {"b": 41}}));
        assert_eq!(run("x.a.b + 1", &[("x", obj)]).unwrap(), Value::Int(42));
    }

    #[test]
    fn missing_propagates_through_arithmetic() {
        let v = run("x * 2 + 1", &[("x", Value::missing())]).unwrap();
        assert!(v.is_missing());
        let v = run("x > 200", &[("x", Value::missing())]).unwrap();
        assert!(v.is_missing());
    }

    #[test]
    fn missing_equals_null_in_expressions() {
        assert_eq!(
            run("x == null", &[("x", Value::missing())]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn division_by_zero_is_a_calc_failure() {
        assert!(run("1 / 0", &[]).is_err());
    }

    #[test]
    fn ternary_and_logic() {
        assert_eq!(
            run("x > 3 ? 'big' : 'small'", &[("x", Value::Int(5))]).unwrap(),
            Value::Str("big".into())
        );
        assert_eq!(run("false || 7", &[]).unwrap(), Value::Int(7));
    }

    #[test]
    fn sum_over_arrays() {
        let items = Value::new_array(vec![Value::Int(10), Value::Int(1)]);
        assert_eq!(run("sum(xs)", &[("xs", items)]).unwrap(), Value::Int(11));
        let holey = Value::new_array(vec![Value::Int(1), Value::missing()]);
        assert!(run("sum(xs)", &[("xs", holey)]).unwrap().is_missing());
    }

    #[test]
    fn decimal_arithmetic_stays_decimal() {
        let d = Value::Decimal("10.5".parse().unwrap());
        match run("x * 2", &[("x", d)]).unwrap() {
            Value::Decimal(d) => assert_eq!(d, "21.0".parse().unwrap()),
            other => panic!("expected decimal, got {:?}", other),
        }
    }

    #[test]
    fn unknown_functions_fail_at_compile_time() {
        assert!(matches!(compile("frobnicate(1)"), Err(Error::Parse(_))));
    }

    #[test]
    fn free_idents_are_collected() {
        let p = compile("price * quantity + sum(totals)").unwrap();
        let names: Vec<String> = p.free_idents().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, ["price", "quantity", "totals"]);
    }

    #[test]
    fn string_concat_with_plus() {
        assert_eq!(
            run("'a' + 'b'", &[]).unwrap(),
            Value::Str("ab".into())
        );
    }
}
