//! Recursive descent parser
//!
//! Precedence, lowest first: `?:`, `||`, `&&`, equality, relational,
//! additive, multiplicative, unary, postfix (member, index, call).

use crate::ast::{BinaryOp, Builtin, Expr, LogicalOp, UnaryOp};
use crate::error::ExprError;
use crate::lexer::{tokenize, Token};
use crate::value::Value;

/// Names that may never appear as an identifier or property, even though
/// the interpreter could not reach anything through them anyway.
pub const DENYLIST: &[&str] = &[
    "process",
    "require",
    "import",
    "eval",
    "Function",
    "constructor",
    "__proto__",
    "prototype",
    "global",
    "globalThis",
    "window",
    "document",
    "module",
    "exports",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "Reflect",
    "Proxy",
    "this",
];

pub const DEFAULT_MAX_DEPTH: usize = 64;

pub fn is_denied(name: &str) -> bool {
    DENYLIST.contains(&name)
}

/// Parse a complete expression
pub fn parse(source: &str, max_depth: usize) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExprError::parse("empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        max_depth,
    };
    let expr = parser.conditional()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(ExprError::parse(format!("unexpected token '{}'", tok))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(ExprError::parse(format!(
                "expected '{}', found '{}'",
                expected, tok
            ))),
            None => Err(ExprError::parse(format!(
                "expected '{}', found end of input",
                expected
            ))),
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ExprError>,
    ) -> Result<T, ExprError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ExprError::TooDeep(self.max_depth));
        }
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn conditional(&mut self) -> Result<Expr, ExprError> {
        self.nested(|p| {
            let test = p.logical_or()?;
            if !p.eat(&Token::Question) {
                return Ok(test);
            }
            let consequent = p.conditional()?;
            p.expect(Token::Colon)?;
            let alternate = p.conditional()?;
            Ok(Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            })
        })
    }

    fn logical_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.logical_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.logical_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn logical_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        ops: fn(&Token) -> Option<BinaryOp>,
        next: fn(&mut Self) -> Result<Expr, ExprError>,
    ) -> Result<Expr, ExprError> {
        let mut left = next(self)?;
        while let Some(op) = self.peek().and_then(ops) {
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            |t| match t {
                Token::EqEq => Some(BinaryOp::Eq),
                Token::EqEqEq => Some(BinaryOp::StrictEq),
                Token::NotEq => Some(BinaryOp::NotEq),
                Token::NotEqEq => Some(BinaryOp::StrictNotEq),
                _ => None,
            },
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            |t| match t {
                Token::Lt => Some(BinaryOp::Lt),
                Token::Le => Some(BinaryOp::Le),
                Token::Gt => Some(BinaryOp::Gt),
                Token::Ge => Some(BinaryOp::Ge),
                _ => None,
            },
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            |t| match t {
                Token::Plus => Some(BinaryOp::Add),
                Token::Minus => Some(BinaryOp::Sub),
                _ => None,
            },
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            |t| match t {
                Token::Star => Some(BinaryOp::Mul),
                Token::Slash => Some(BinaryOp::Div),
                Token::Percent => Some(BinaryOp::Rem),
                _ => None,
            },
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Plus,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.nested(|p| {
            let operand = p.unary()?;
            Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            })
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let property = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    Some(tok) => {
                        return Err(ExprError::parse(format!(
                            "expected property name, found '{}'",
                            tok
                        )))
                    }
                    None => return Err(ExprError::parse("expected property name")),
                };
                check_name(&property)?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.conditional()?;
                self.expect(Token::RBracket)?;
                if let Expr::Literal(Value::String(key)) = &index {
                    check_name(key)?;
                }
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat(&Token::LParen) {
                let args = self.arguments(Token::RParen)?;
                expr = resolve_call(expr, args)?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self, close: Token) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.conditional()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) | Some(Token::Undefined) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => {
                check_name(&name)?;
                Ok(Expr::Ident(name))
            }
            Some(Token::LParen) => {
                let inner = self.conditional()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let items = self.nested(|p| p.arguments(Token::RBracket))?;
                Ok(Expr::Array(items))
            }
            Some(tok) => Err(ExprError::parse(format!("unexpected token '{}'", tok))),
            None => Err(ExprError::parse("unexpected end of input")),
        }
    }
}

fn check_name(name: &str) -> Result<(), ExprError> {
    if is_denied(name) {
        return Err(ExprError::Denied(format!("reference to '{}'", name)));
    }
    Ok(())
}

fn resolve_call(callee: Expr, mut args: Vec<Expr>) -> Result<Expr, ExprError> {
    let function = match callee {
        Expr::Ident(name) => Builtin::resolve(None, &name)
            .ok_or_else(|| ExprError::Denied(format!("call to '{}'", name)))?,
        Expr::Member { object, property } => match *object {
            Expr::Ident(ref ns) if ns == "Math" || ns == "Array" => {
                Builtin::resolve(Some(ns.as_str()), &property)
                    .ok_or_else(|| ExprError::Denied(format!("call to '{}.{}'", ns, property)))?
            }
            receiver if property == "hasOwnProperty" => {
                args.insert(0, receiver);
                Builtin::HasOwnProperty
            }
            _ => return Err(ExprError::Denied(format!("call to method '{}'", property))),
        },
        _ => return Err(ExprError::Denied("call of a computed value".to_string())),
    };
    Ok(Expr::Call { function, args })
}
