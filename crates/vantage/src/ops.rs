//! Built-in functions applied by `Apply` nodes.

use crate::error::EvalError;
use crate::value::{is_true, Value};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    Plus,
    Minus,
    Mul,
    Div,
    Not,
    Equal,
    LessThan,
    Size,
    Concat,
    Empty,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Plus => "plus",
            Builtin::Minus => "minus",
            Builtin::Mul => "mul",
            Builtin::Div => "div",
            Builtin::Not => "not",
            Builtin::Equal => "equal",
            Builtin::LessThan => "lessThan",
            Builtin::Size => "size",
            Builtin::Concat => "concat",
            Builtin::Empty => "empty",
        }
    }

    /// `None` for variadic functions.
    pub fn arity(self) -> Option<usize> {
        match self {
            Builtin::Plus | Builtin::Minus | Builtin::Mul | Builtin::Div => Some(2),
            Builtin::Equal | Builtin::LessThan => Some(2),
            Builtin::Not | Builtin::Size | Builtin::Empty => Some(1),
            Builtin::Concat => None,
        }
    }

    pub fn apply(self, args: &[&[Value]]) -> Result<Vec<Value>, EvalError> {
        if let Some(expected) = self.arity() {
            if args.len() != expected {
                return Err(EvalError::Arity {
                    op: self.name(),
                    expected,
                    found: args.len(),
                });
            }
        }
        match self {
            Builtin::Plus => arithmetic(self, args[0], args[1], |a, b| Ok(a + b)),
            Builtin::Minus => arithmetic(self, args[0], args[1], |a, b| Ok(a - b)),
            Builtin::Mul => arithmetic(self, args[0], args[1], |a, b| Ok(a * b)),
            Builtin::Div => arithmetic(self, args[0], args[1], |a, b| {
                if b == 0.0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(a / b)
                }
            }),
            Builtin::LessThan => {
                let numbers = arithmetic(self, args[0], args[1], |a, b| Ok(if a < b { 1.0 } else { 0.0 }))?;
                Ok(numbers
                    .into_iter()
                    .map(|v| Value::Bool(v.as_number() == Some(1.0)))
                    .collect())
            }
            Builtin::Not => Ok(vec![Value::Bool(!is_true(args[0]))]),
            Builtin::Equal => Ok(vec![Value::Bool(args[0] == args[1])]),
            Builtin::Size => Ok(vec![Value::Number(args[0].len() as f64)]),
            Builtin::Empty => Ok(vec![Value::Bool(args[0].is_empty())]),
            Builtin::Concat => Ok(args.iter().flat_map(|os| os.iter().cloned()).collect()),
        }
    }
}

/// Element-wise numeric operation; a single element is broadcast.
fn arithmetic(
    op: Builtin,
    left: &[Value],
    right: &[Value],
    f: impl Fn(f64, f64) -> Result<f64, EvalError>,
) -> Result<Vec<Value>, EvalError> {
    if left.is_empty() || right.is_empty() {
        return Ok(Vec::new());
    }
    let len = match (left.len(), right.len()) {
        (l, r) if l == r => l,
        (1, r) => r,
        (l, 1) => l,
        (l, r) => {
            return Err(EvalError::LengthMismatch {
                op: op.name(),
                left: l,
                right: r,
            })
        }
    };
    (0..len)
        .map(|i| {
            let a = number(op, &left[i.min(left.len() - 1)])?;
            let b = number(op, &right[i.min(right.len() - 1)])?;
            f(a, b).map(Value::Number)
        })
        .collect()
}

fn number(op: Builtin, value: &Value) -> Result<f64, EvalError> {
    value.as_number().ok_or_else(|| EvalError::TypeMismatch {
        op: op.name(),
        expected: "number",
        found: value.to_string(),
    })
}
