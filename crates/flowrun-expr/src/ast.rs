//! Expression tree

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    StrictEq,
    NotEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Whitelisted callables. Calls are resolved at parse time; there is no
/// way to call a value obtained from the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    ParseInt,
    ParseFloat,
    Number,
    IsNaN,
    IsFinite,
    MathMin,
    MathMax,
    MathRound,
    MathFloor,
    MathCeil,
    MathAbs,
    ArrayIsArray,
    /// `obj.hasOwnProperty(key)`, receiver passed as first argument
    HasOwnProperty,
}

impl Builtin {
    /// Resolve a global (`parseInt`) or namespaced (`Math.max`) name
    pub fn resolve(namespace: Option<&str>, name: &str) -> Option<Self> {
        let builtin = match (namespace, name) {
            (None, "parseInt") => Builtin::ParseInt,
            (None, "parseFloat") => Builtin::ParseFloat,
            (None, "Number") => Builtin::Number,
            (None, "isNaN") => Builtin::IsNaN,
            (None, "isFinite") => Builtin::IsFinite,
            (None, "hasOwnProperty") => Builtin::HasOwnProperty,
            (Some("Math"), "min") => Builtin::MathMin,
            (Some("Math"), "max") => Builtin::MathMax,
            (Some("Math"), "round") => Builtin::MathRound,
            (Some("Math"), "floor") => Builtin::MathFloor,
            (Some("Math"), "ceil") => Builtin::MathCeil,
            (Some("Math"), "abs") => Builtin::MathAbs,
            (Some("Array"), "isArray") => Builtin::ArrayIsArray,
            _ => return None,
        };
        Some(builtin)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Array(Vec<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Call {
        function: Builtin,
        args: Vec<Expr>,
    },
}
