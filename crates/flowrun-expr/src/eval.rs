//! Interpreter and the public entry points

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::ast::{BinaryOp, Builtin, Expr, LogicalOp, UnaryOp};
use crate::error::ExprError;
use crate::parser::{self, is_denied, DEFAULT_MAX_DEPTH};
use crate::value::{format_number, Value};

pub const DEFAULT_MAX_LEN: usize = 1024;

/// Evaluates guard expressions against a run context
#[derive(Debug, Clone)]
pub struct Evaluator {
    max_len: usize,
    max_depth: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Evaluator {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            ..Self::default()
        }
    }

    /// Parse and check an expression without running it
    pub fn compile(&self, source: &str) -> Result<Expr, ExprError> {
        if source.len() > self.max_len {
            return Err(ExprError::TooLong {
                len: source.len(),
                max: self.max_len,
            });
        }
        parser::parse(source, self.max_depth)
    }

    pub fn try_evaluate(
        &self,
        source: &str,
        context: &Map<String, JsonValue>,
    ) -> Result<Value, ExprError> {
        let expr = self.compile(source)?;
        Scope { context }.eval(&expr)
    }

    /// Evaluate to a boolean. Never fails: errors are logged and read as
    /// `false`, so a broken guard only means the edge is not taken.
    pub fn evaluate(&self, source: &str, context: &Map<String, JsonValue>) -> bool {
        match self.try_evaluate(source, context) {
            Ok(value) => {
                let result = value.truthy();
                debug!(expression = %source, result, "Evaluated guard");
                result
            }
            Err(e) => {
                warn!(expression = %source, error = %e, "Expression evaluation failed, treating as false");
                false
            }
        }
    }
}

/// Evaluate with default limits
pub fn evaluate(source: &str, context: &Map<String, JsonValue>) -> bool {
    Evaluator::default().evaluate(source, context)
}

struct Scope<'a> {
    context: &'a Map<String, JsonValue>,
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self
                .context
                .get(name)
                .map(Value::from_json)
                .ok_or_else(|| ExprError::eval(format!("{} is not defined", name))),
            Expr::Member { object, property } => {
                let object = self.eval(object)?;
                member(&object, property)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let key = match self.eval(index)? {
                    Value::Number(n) => format_number(n),
                    other => other.to_string(),
                };
                if is_denied(&key) {
                    return Err(ExprError::Denied(format!("reference to '{}'", key)));
                }
                member(&object, &key)
            }
            Expr::Array(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!v.truthy()),
                    UnaryOp::Neg => Value::Number(-v.to_number()),
                    UnaryOp::Plus => Value::Number(v.to_number()),
                })
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                Ok(binary(*op, &l, &r))
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                match (op, l.truthy()) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(l),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Call { function, args } => {
                let args = args
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(call(*function, &args))
            }
        }
    }
}

fn member(object: &Value, property: &str) -> Result<Value, ExprError> {
    if matches!(object, Value::Null) {
        return Err(ExprError::eval(format!(
            "cannot read property '{}' of null",
            property
        )));
    }
    Ok(object.get(property))
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    let num = |f: fn(f64, f64) -> f64| Value::Number(f(l.to_number(), r.to_number()));
    match op {
        BinaryOp::Add => match (l, r) {
            (Value::String(_), _) | (_, Value::String(_)) => Value::String(format!("{}{}", l, r)),
            _ => num(|a, b| a + b),
        },
        BinaryOp::Sub => num(|a, b| a - b),
        BinaryOp::Mul => num(|a, b| a * b),
        BinaryOp::Div => num(|a, b| a / b),
        BinaryOp::Rem => num(|a, b| a % b),
        BinaryOp::Eq => Value::Bool(l.loose_eq(r)),
        BinaryOp::NotEq => Value::Bool(!l.loose_eq(r)),
        BinaryOp::StrictEq => Value::Bool(l.strict_eq(r)),
        BinaryOp::StrictNotEq => Value::Bool(!l.strict_eq(r)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => l.to_number().partial_cmp(&r.to_number()),
            };
            let Some(ordering) = ordering else {
                return Value::Bool(false);
            };
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
    }
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Null)
}

fn call(function: Builtin, args: &[Value]) -> Value {
    let first = arg(args, 0);
    match function {
        Builtin::ParseInt => {
            let radix = match args.get(1) {
                Some(v) => v.to_number() as u32,
                None => 10,
            };
            Value::Number(parse_int(&first.to_string(), radix))
        }
        Builtin::ParseFloat => Value::Number(parse_float(&first.to_string())),
        Builtin::Number => Value::Number(first.to_number()),
        Builtin::IsNaN => Value::Bool(first.to_number().is_nan()),
        Builtin::IsFinite => Value::Bool(first.to_number().is_finite()),
        Builtin::MathMin => Value::Number(
            args.iter()
                .map(Value::to_number)
                .fold(f64::INFINITY, |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.min(n) }),
        ),
        Builtin::MathMax => Value::Number(
            args.iter()
                .map(Value::to_number)
                .fold(f64::NEG_INFINITY, |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(n) }),
        ),
        Builtin::MathRound => Value::Number((first.to_number() + 0.5).floor()),
        Builtin::MathFloor => Value::Number(first.to_number().floor()),
        Builtin::MathCeil => Value::Number(first.to_number().ceil()),
        Builtin::MathAbs => Value::Number(first.to_number().abs()),
        Builtin::ArrayIsArray => Value::Bool(matches!(first, Value::Array(_))),
        Builtin::HasOwnProperty => {
            let key = arg(args, 1).to_string();
            Value::Bool(match first {
                Value::Object(map) => map.contains_key(&key),
                Value::Array(items) => key.parse::<usize>().map_or(false, |i| i < items.len()),
                _ => false,
            })
        }
    }
}

/// Leading integer in `radix`, NaN when there is none
fn parse_int(s: &str, radix: u32) -> f64 {
    let s = s.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, s) = match radix {
        0 | 16 => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(rest) => (16, rest),
            None => (if radix == 0 { 10 } else { radix }, s),
        },
        r => (r, s),
    };
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let mut value: f64 = 0.0;
    let mut seen = false;
    for c in s.chars() {
        match c.to_digit(radix) {
            Some(d) => {
                value = value * radix as f64 + d as f64;
                seen = true;
            }
            None => break,
        }
    }
    match (seen, negative) {
        (false, _) => f64::NAN,
        (true, true) => -value,
        (true, false) => value,
    }
}

/// Longest numeric prefix, NaN when there is none
fn parse_float(s: &str) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start || &s[digits_start..end] == "." {
        return if s[digits_start..].starts_with("Infinity") {
            if s.starts_with('-') {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }
        } else {
            f64::NAN
        };
    }
    let mantissa_end = end;
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    s[..end]
        .parse::<f64>()
        .or_else(|_| s[..mantissa_end].parse::<f64>())
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_arithmetic_guard_with_empty_context() {
        assert!(evaluate("1 + 1 == 2", &Map::new()));
        assert!(!evaluate("1 + 1 == 3", &Map::new()));
        assert!(evaluate("10 % 3 === 1 && 2 * 3 > 5", &Map::new()));
    }

    #[test]
    fn test_denied_expression_is_false() {
        assert!(!evaluate("process.exit()", &Map::new()));
        assert!(!evaluate("this.constructor", &Map::new()));
        let c = ctx(json!({"key": "constructor", "obj": {}}));
        assert!(!evaluate("obj[key]", &c));
    }

    #[test]
    fn test_context_access() {
        let c = ctx(json!({
            "fetch_result": {"status": 200, "items": [1, 2, 3]},
            "input": {"name": "ada"}
        }));
        assert!(evaluate("fetch_result.status === 200", &c));
        assert!(evaluate("fetch_result.items.length >= 3", &c));
        assert!(evaluate("fetch_result.items[0] == '1'", &c));
        assert!(evaluate("input.name + '!' === 'ada!'", &c));
        assert!(evaluate("fetch_result.hasOwnProperty('items')", &c));
        assert!(!evaluate("fetch_result.missing.deeper", &c));
    }

    #[test]
    fn test_undefined_variable_is_false() {
        assert!(!evaluate("nope > 1", &Map::new()));
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        let c = ctx(json!({"a": null}));
        // right side would fail on null property access
        assert!(!evaluate("a !== null && a.b", &c));
        assert!(evaluate("a === null || a.b", &c));
        let v = Evaluator::default().try_evaluate("0 || 'x'", &c).unwrap();
        assert_eq!(v, Value::String("x".into()));
    }

    #[test]
    fn test_whitelisted_functions() {
        let e = Map::new();
        assert!(evaluate("parseInt('42px') === 42", &e));
        assert!(evaluate("parseInt('ff', 16) === 255", &e));
        assert!(evaluate("parseFloat('3.5kg') === 3.5", &e));
        assert!(evaluate("isNaN(parseInt('abc'))", &e));
        assert!(evaluate("Math.max(1, 7, 3) == 7 && Math.min(4, 2) == 2", &e));
        assert!(evaluate("Math.round(2.5) == 3 && Math.floor(-1.5) == -2", &e));
        assert!(evaluate("Math.ceil(1.1) == 2 && Math.abs(-4) == 4", &e));
        assert!(evaluate("Array.isArray([1, 2]) && !Array.isArray('x')", &e));
        assert!(evaluate("!isFinite(1 / 0) && Number('12') === 12", &e));
    }

    #[test]
    fn test_ternary() {
        let c = ctx(json!({"n": 5}));
        assert!(evaluate("(n > 3 ? 'big' : 'small') === 'big'", &c));
    }

    #[test]
    fn test_length_limit() {
        let evaluator = Evaluator::new(8);
        let err = evaluator.try_evaluate("1 + 1 == 2 && true", &Map::new());
        assert!(matches!(err, Err(ExprError::TooLong { max: 8, .. })));
        assert!(!evaluator.evaluate("1 + 1 == 2 && true", &Map::new()));
    }

    #[test]
    fn test_never_panics_on_garbage() {
        for src in ["", "(", ")", "a.", "[1,", "1 ? 2", "!!!", "'unterminated", "a[", "=="] {
            assert!(!evaluate(src, &Map::new()), "{:?}", src);
        }
    }
}
