use thiserror::Error;

/// Errors raised while compiling or running an expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character at offset {position}")]
    Lex { position: usize },

    #[error("parse error: {0}")]
    Parse(String),

    /// Reference to a forbidden name or a non-whitelisted call
    #[error("denied: {0}")]
    Denied(String),

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("expression is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("expression nests deeper than {0}")]
    TooDeep(usize),
}

impl ExprError {
    pub fn parse(msg: impl Into<String>) -> Self {
        ExprError::Parse(msg.into())
    }

    pub fn eval(msg: impl Into<String>) -> Self {
        ExprError::Eval(msg.into())
    }
}
