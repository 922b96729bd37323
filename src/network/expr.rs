//! Rate-law expressions.
//!
//! Parsed once into an [`Expr`] tree, then bound against a flat value table
//! so propensities evaluate without name lookups inside the SSA loop.

use crate::{CrnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Exp,
    Log,
    Sqrt,
    Pow,
    Min,
    Max,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "exp" => Some(Func::Exp),
            "log" | "ln" => Some(Func::Log),
            "sqrt" => Some(Func::Sqrt),
            "pow" => Some(Func::Pow),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Exp | Func::Log | Func::Sqrt => 1,
            Func::Pow | Func::Min | Func::Max => 2,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Func::Exp => args[0].exp(),
            Func::Log => args[0].ln(),
            Func::Sqrt => args[0].sqrt(),
            Func::Pow => args[0].powf(args[1]),
            Func::Min => args[0].min(args[1]),
            Func::Max => args[0].max(args[1]),
        }
    }
}

/// Expression tree with identifiers still unresolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

/// Expression tree whose identifiers index a value table.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    Num(f64),
    Slot(usize),
    Neg(Box<BoundExpr>),
    Binary(BinOp, Box<BoundExpr>, Box<BoundExpr>),
    Call(Func, Vec<BoundExpr>),
}

impl Expr {
    /// Identifiers referenced by the expression, in first-use order.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Neg(inner) => inner.collect_identifiers(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_identifiers(out);
                }
            }
        }
    }

    /// Evaluates with a name lookup; `None` when a name is unknown.
    pub fn eval_with<F>(&self, lookup: &F) -> Option<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        Some(match self {
            Expr::Num(v) => *v,
            Expr::Var(name) => lookup(name)?,
            Expr::Neg(inner) => -inner.eval_with(lookup)?,
            Expr::Binary(op, lhs, rhs) => apply_bin(*op, lhs.eval_with(lookup)?, rhs.eval_with(lookup)?),
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval_with(lookup))
                    .collect::<Option<Vec<_>>>()?;
                func.apply(&values)
            }
        })
    }

    /// Replaces every identifier with its slot in a value table.
    pub fn bind<F>(&self, resolve: &F) -> std::result::Result<BoundExpr, String>
    where
        F: Fn(&str) -> Option<usize>,
    {
        Ok(match self {
            Expr::Num(v) => BoundExpr::Num(*v),
            Expr::Var(name) => BoundExpr::Slot(resolve(name).ok_or_else(|| name.clone())?),
            Expr::Neg(inner) => BoundExpr::Neg(Box::new(inner.bind(resolve)?)),
            Expr::Binary(op, lhs, rhs) => {
                BoundExpr::Binary(*op, Box::new(lhs.bind(resolve)?), Box::new(rhs.bind(resolve)?))
            }
            Expr::Call(func, args) => BoundExpr::Call(
                *func,
                args.iter()
                    .map(|arg| arg.bind(resolve))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            ),
        })
    }
}

impl BoundExpr {
    pub fn eval(&self, values: &[f64]) -> f64 {
        match self {
            BoundExpr::Num(v) => *v,
            BoundExpr::Slot(idx) => values[*idx],
            BoundExpr::Neg(inner) => -inner.eval(values),
            BoundExpr::Binary(op, lhs, rhs) => apply_bin(*op, lhs.eval(values), rhs.eval(values)),
            BoundExpr::Call(func, args) => {
                let mut buf = [0.0; 2];
                for (slot, arg) in buf.iter_mut().zip(args) {
                    *slot = arg.eval(values);
                }
                func.apply(&buf[..args.len()])
            }
        }
    }
}

fn apply_bin(op: BinOp, lhs: f64, rhs: f64) -> f64 {
    match op {
        BinOp::Add => lhs + rhs,
        BinOp::Sub => lhs - rhs,
        BinOp::Mul => lhs * rhs,
        BinOp::Div => lhs / rhs,
        BinOp::Pow => lhs.powf(rhs),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str, line: usize) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
        } else if ch.is_ascii_digit() || (ch == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
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
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| CrnError::parse(line, format!("invalid number '{text}'")))?;
            tokens.push(Token::Num(value));
        } else if ch.is_alphabetic() || ch == '_' || ch == '$' {
            // `$` marks boundary species in declarations; rate laws may carry it too.
            let start = if ch == '$' { i + 1 } else { i };
            i += 1;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            if name.is_empty() {
                return Err(CrnError::parse(line, "dangling '$' in expression"));
            }
            tokens.push(Token::Ident(name));
        } else {
            let token = match ch {
                '+' | '-' | '*' | '/' | '^' => Token::Op(ch),
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                other => {
                    return Err(CrnError::parse(
                        line,
                        format!("unexpected character '{other}' in expression"),
                    ))
                }
            };
            tokens.push(token);
            i += 1;
        }
    }

    Ok(tokens)
}

/// Parses an arithmetic expression; `line` is used for error reporting.
pub fn parse_expr(src: &str, line: usize) -> Result<Expr> {
    let tokens = tokenize(src, line)?;
    if tokens.is_empty() {
        return Err(CrnError::parse(line, "empty expression"));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        line,
    };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(CrnError::parse(line, "trailing tokens after expression"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
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

    fn err(&self, message: impl Into<String>) -> CrnError {
        CrnError::parse(self.line, message)
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = if *op == '+' { BinOp::Add } else { BinOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = if *op == '*' { BinOp::Mul } else { BinOp::Div };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.atom()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            // right associative: a^b^c == a^(b^c)
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    return self.call(name);
                }
                Ok(Expr::Var(name))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("missing ')'")),
                }
            }
            Some(token) => Err(self.err(format!("unexpected token {token:?}"))),
            None => Err(self.err("unexpected end of expression")),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr> {
        let func = Func::from_name(&name).ok_or_else(|| self.err(format!("unknown function '{name}'")))?;

        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
        } else {
            loop {
                args.push(self.expr()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    _ => return Err(self.err(format!("malformed argument list for '{name}'"))),
                }
            }
        }

        if args.len() != func.arity() {
            return Err(self.err(format!(
                "'{name}' takes {} argument(s), got {}",
                func.arity(),
                args.len()
            )));
        }
        Ok(Expr::Call(func, args))
    }
}
