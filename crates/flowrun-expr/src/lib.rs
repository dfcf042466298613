//! Safe expression evaluation for edge guards
//!
//! Guards are parsed into a small AST and interpreted against the run
//! context. The grammar has no assignment, no function definitions and no
//! host access: the only callable names are a fixed whitelist of pure
//! functions. Any failure evaluates to `false`.
//!
//! ```
//! use serde_json::{json, Map};
//!
//! let mut ctx = Map::new();
//! ctx.insert("fetch_result".into(), json!({"status": 200}));
//! assert!(flowrun_expr::evaluate("fetch_result.status === 200", &ctx));
//! assert!(!flowrun_expr::evaluate("process.exit()", &ctx));
//! ```

pub mod ast;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

pub use error::ExprError;
pub use eval::{evaluate, Evaluator};
pub use value::Value;
