// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Algebraic formulas over a single normalized coordinate `x`.
//!
//! The accepted grammar follows numpy-style expressions as users type them:
//!
//! ```text
//! expr  := term (('+' | '-') term)*
//! term  := unary (('*' | '/') unary)*
//! unary := ('-' | '+') unary | power
//! power := atom (('**' | '^') unary)?
//! atom  := number | 'x' | constant | function '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! `^` is an alias for `**`. Identifiers may carry a `np.`, `numpy.` or
//! `math.` prefix, which is ignored.

use std::fmt;

use logos::Logos;

use crate::{Error, Result};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?", |lex| lex.slice().to_string())]
    Ident(String),
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("**")]
    #[token("^")]
    Power,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Sin,
    Cos,
    Tan,
    Arcsin,
    Arccos,
    Arctan,
    Sqrt,
    Exp,
    Log,
    Abs,
    Min,
    Max,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "arcsin" | "asin" => Function::Arcsin,
            "arccos" | "acos" => Function::Arccos,
            "arctan" | "atan" => Function::Arctan,
            "sqrt" => Function::Sqrt,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "abs" => Function::Abs,
            "min" | "minimum" => Function::Min,
            "max" | "maximum" => Function::Max,
            _ => return None,
        };
        Some(f)
    }

    fn arity(self) -> usize {
        match self {
            Function::Min | Function::Max => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        let a = args[0];
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Arcsin => a.asin(),
            Function::Arccos => a.acos(),
            Function::Arctan => a.atan(),
            Function::Sqrt => a.sqrt(),
            Function::Exp => a.exp(),
            Function::Log => a.ln(),
            Function::Abs => a.abs(),
            Function::Min => a.min(args[1]),
            Function::Max => a.max(args[1]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    X,
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    fn eval(&self, x: f64) -> f64 {
        match self {
            Expr::Number(value) => *value,
            Expr::X => x,
            Expr::Negate(inner) => -inner.eval(x),
            Expr::Binary(op, lhs, rhs) => {
                let (lhs, rhs) = (lhs.eval(x), rhs.eval(x));
                match op {
                    BinaryOp::Add => lhs + rhs,
                    BinaryOp::Sub => lhs - rhs,
                    BinaryOp::Mul => lhs * rhs,
                    BinaryOp::Div => lhs / rhs,
                    BinaryOp::Pow => lhs.powf(rhs),
                }
            }
            Expr::Call(function, args) => {
                let values: Vec<f64> = args.iter().map(|arg| arg.eval(x)).collect();
                function.apply(&values)
            }
        }
    }

    fn uses_x(&self) -> bool {
        match self {
            Expr::Number(_) => false,
            Expr::X => true,
            Expr::Negate(inner) => inner.uses_x(),
            Expr::Binary(_, lhs, rhs) => lhs.uses_x() || rhs.uses_x(),
            Expr::Call(_, args) => args.iter().any(Expr::uses_x),
        }
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error<S: Into<String>>(&self, message: S) -> Error {
        Error::Formula {
            formula: self.source.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected {expected:?}, found {token:?}"))),
            None => Err(self.error(format!("expected {expected:?}, found end of input"))),
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Negate(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::Power) {
            self.pos += 1;
            // Right associative, and the exponent may carry its own sign.
            let exponent = self.unary()?;
            return Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.identifier(&name),
            Some(token) => Err(self.error(format!("unexpected token {token:?}"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn identifier(&mut self, name: &str) -> Result<Expr> {
        let name = ["np.", "numpy.", "math."]
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .unwrap_or(name);
        match name {
            "x" => return Ok(Expr::X),
            "pi" => return Ok(Expr::Number(std::f64::consts::PI)),
            "inf" => return Ok(Expr::Number(f64::INFINITY)),
            _ => {}
        }
        let Some(function) = Function::from_name(name) else {
            return Err(self.error(format!("unknown name '{name}'")));
        };
        self.expect(Token::LParen)?;
        let mut args = vec![self.expression()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            args.push(self.expression()?);
        }
        self.expect(Token::RParen)?;
        if args.len() != function.arity() {
            return Err(self.error(format!(
                "'{name}' takes {} argument(s), got {}",
                function.arity(),
                args.len()
            )));
        }
        Ok(Expr::Call(function, args))
    }
}

/// A parsed formula `f(x)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(text).spanned() {
            match token {
                Ok(token) => tokens.push(token),
                Err(()) => {
                    return Err(Error::Formula {
                        formula: text.to_string(),
                        message: format!(
                            "unexpected character '{}' at position {}",
                            &text[span.clone()],
                            span.start
                        ),
                    });
                }
            }
        }
        if tokens.is_empty() {
            return Err(Error::Formula {
                formula: text.to_string(),
                message: "empty expression".to_string(),
            });
        }
        let mut parser = Parser {
            source: text,
            tokens,
            pos: 0,
        };
        let expr = parser.expression()?;
        if let Some(token) = parser.peek() {
            return Err(parser.error(format!("unexpected trailing token {token:?}")));
        }
        Ok(Formula {
            source: text.to_string(),
            expr,
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.expr.eval(x)
    }

    /// Whether the formula depends on `x` at all.
    pub fn uses_x(&self) -> bool {
        self.expr.uses_x()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Sample the formula at `count` points `x = i / (count - 1)`, covering `[0, 1]`.
    pub fn sample_inclusive(&self, count: usize) -> Vec<f64> {
        if count < 2 {
            return (0..count).map(|_| self.eval(0.0)).collect();
        }
        let last = (count - 1) as f64;
        (0..count).map(|i| self.eval(i as f64 / last)).collect()
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Evaluate a numeric text field that must not depend on `x`.
pub fn evaluate_constant(text: &str) -> Result<f64> {
    let formula = Formula::parse(text.trim())?;
    if formula.uses_x() {
        return Err(Error::Formula {
            formula: text.to_string(),
            message: "a constant value cannot depend on 'x'".to_string(),
        });
    }
    let value = formula.eval(0.0);
    if !value.is_finite() {
        return Err(Error::NotFinite(text.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str, x: f64) -> f64 {
        Formula::parse(text).unwrap().eval(x)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * 3", 0.0), 7.0);
        assert_eq!(eval("(1 + 2) * 3", 0.0), 9.0);
        assert_eq!(eval("-2**2", 0.0), -4.0);
        assert_eq!(eval("2^3", 0.0), 8.0);
        assert_eq!(eval("2**-1", 0.0), 0.5);
        assert_eq!(eval("2**3**2", 0.0), 512.0);
        assert_eq!(eval("8 / 4 / 2", 0.0), 1.0);
        assert_eq!(eval("1 - 2 - 3", 0.0), -4.0);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(eval("1e-3", 0.0), 1e-3);
        assert_eq!(eval(".5", 0.0), 0.5);
        assert_eq!(eval("2.", 0.0), 2.0);
        assert_eq!(eval("1.5E2", 0.0), 150.0);
    }

    #[test]
    fn test_functions_and_x() {
        assert!((eval("sin(pi*x)", 0.5) - 1.0).abs() < 1e-12);
        assert!((eval("np.cos(2*np.pi*x)", 1.0) - 1.0).abs() < 1e-12);
        assert!((eval("sqrt(x)", 4.0) - 2.0).abs() < 1e-12);
        assert!((eval("exp(0)", 0.0) - 1.0).abs() < 1e-12);
        assert_eq!(eval("max(x, 0.2)", 0.1), 0.2);
        assert_eq!(eval("min(x, 0.2)", 0.1), 0.1);
        let hann = "0.42 - 0.5*cos(2*pi*x) + 0.08*cos(4*pi*x)";
        assert!(eval(hann, 0.0).abs() < 1e-12);
        assert!((eval(hann, 0.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Formula::parse("foo(x)"),
            Err(Error::Formula { .. })
        ));
        assert!(Formula::parse("(1 + 2").is_err());
        assert!(Formula::parse("1 2").is_err());
        assert!(Formula::parse("").is_err());
        assert!(Formula::parse("1 $ 2").is_err());
        assert!(Formula::parse("max(1)").is_err());
        assert!(Formula::parse("sin").is_err());
    }

    #[test]
    fn test_uses_x() {
        assert!(Formula::parse("2*x").unwrap().uses_x());
        assert!(!Formula::parse("2*pi").unwrap().uses_x());
    }

    #[test]
    fn test_evaluate_constant() {
        assert_eq!(evaluate_constant(" 10 ").unwrap(), 10.0);
        assert_eq!(evaluate_constant("2*5").unwrap(), 10.0);
        assert!(evaluate_constant("x").is_err());
        assert!(matches!(
            evaluate_constant("1/0"),
            Err(Error::NotFinite(_))
        ));
        assert!(evaluate_constant("BlinkTime").is_err());
    }

    #[test]
    fn test_sample_inclusive() {
        let formula = Formula::parse("x").unwrap();
        let samples = formula.sample_inclusive(5);
        assert_eq!(samples, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }
}
