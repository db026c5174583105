use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::parser::{BinaryOp, Func, Node, UnaryOp};
use super::ExprError;
use crate::data::Data;
use crate::types::Value;

/// Variable lookup for expression evaluation. Unknown names evaluate to
/// `null`.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Scope for Data {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Scope for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Scope for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Scope for Value {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

type Eval<'s> = Result<Cow<'s, Value>, ExprError>;

static NULL: Value = Value::Null;

pub(crate) fn eval<'s>(node: &Node, scope: &'s dyn Scope) -> Eval<'s> {
    match node {
        Node::Literal(v) => Ok(Cow::Owned(v.clone())),
        Node::Var(name) => Ok(Cow::Borrowed(scope.lookup(name).unwrap_or(&NULL))),
        Node::Member(target, field) => {
            let target = eval(target, scope)?;
            Ok(project(target, |v| v.get(field)))
        }
        Node::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?;
            match index.as_ref() {
                Value::Int(i) => {
                    let i = *i;
                    Ok(project(target, |v| {
                        let items = v.as_array()?;
                        usize::try_from(i).ok().and_then(|i| items.get(i))
                    }))
                }
                Value::String(key) => {
                    let key = key.clone();
                    Ok(project(target, |v| v.get(&key)))
                }
                other => Err(ExprError::type_error(format!(
                    "cannot index with a {}",
                    other.type_name()
                ))),
            }
        }
        Node::Unary(op, operand) => {
            let value = eval(operand, scope)?;
            unary(*op, &value).map(Cow::Owned)
        }
        Node::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            binary(*op, &lhs, &rhs).map(Cow::Owned)
        }
        Node::And(lhs, rhs) => {
            if !truth(eval(lhs, scope)?.as_ref(), "&&")? {
                return Ok(Cow::Owned(Value::Bool(false)));
            }
            let rhs = truth(eval(rhs, scope)?.as_ref(), "&&")?;
            Ok(Cow::Owned(Value::Bool(rhs)))
        }
        Node::Or(lhs, rhs) => {
            if truth(eval(lhs, scope)?.as_ref(), "||")? {
                return Ok(Cow::Owned(Value::Bool(true)));
            }
            let rhs = truth(eval(rhs, scope)?.as_ref(), "||")?;
            Ok(Cow::Owned(Value::Bool(rhs)))
        }
        Node::Conditional(cond, then, otherwise) => {
            if truth(eval(cond, scope)?.as_ref(), "?:")? {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Node::Array(items) => items
            .iter()
            .map(|item| eval(item, scope).map(Cow::into_owned))
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Cow::Owned(Value::Array(items))),
        Node::Map(entries) => entries
            .iter()
            .map(|(k, v)| eval(v, scope).map(|v| (k.clone(), v.into_owned())))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(|map| Cow::Owned(Value::Map(map))),
        Node::Call(func, arg) => {
            let arg = eval(arg, scope)?;
            call(*func, &arg).map(Cow::Owned)
        }
    }
}

/// Applies a borrowing projection to a possibly owned value, keeping the
/// borrow when the input was borrowed. Missing results become `null`.
fn project<'s>(target: Cow<'s, Value>, f: impl Fn(&Value) -> Option<&Value>) -> Cow<'s, Value> {
    match target {
        Cow::Borrowed(v) => Cow::Borrowed(f(v).unwrap_or(&NULL)),
        Cow::Owned(v) => Cow::Owned(f(&v).cloned().unwrap_or_default()),
    }
}

fn truth(value: &Value, op: &'static str) -> Result<bool, ExprError> {
    value.as_bool().ok_or_else(|| {
        ExprError::type_error(format!("{op} expects bool operands, found {}", value.type_name()))
    })
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, ExprError> {
    match (op, value) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ExprError::type_error("integer overflow")),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, other) => Err(ExprError::type_error(format!(
            "cannot negate a {}",
            other.type_name()
        ))),
        (UnaryOp::Neg, other) => Err(ExprError::type_error(format!(
            "cannot apply unary - to a {}",
            other.type_name()
        ))),
    }
}

fn mismatch(op: BinaryOp, lhs: &Value, rhs: &Value) -> ExprError {
    ExprError::type_error(format!(
        "cannot apply {} to {} and {}",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// Equality with numeric promotion: `1 == 1.0`.
fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            matches!(compare_numbers(lhs, rhs), Some(Ordering::Equal))
        }
        _ => lhs == rhs,
    }
}

fn compare_numbers(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        _ => lhs.as_f64()?.partial_cmp(&rhs.as_f64()?),
    }
}

#[allow(clippy::cast_precision_loss)]
fn int_to_f64(i: i64) -> f64 {
    i as f64
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Rem => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.checked_rem(b)
            }
            BinaryOp::Div => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                if a.checked_rem(b) != Some(0) {
                    return Ok(Value::Float(int_to_f64(a) / int_to_f64(b)));
                }
                a.checked_div(b)
            }
            _ => return Err(mismatch(op, lhs, rhs)),
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| ExprError::type_error("integer overflow"));
    }

    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(mismatch(op, lhs, rhs));
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ExprError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(mismatch(op, lhs, rhs)),
    };
    Ok(Value::Float(result))
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => compare_numbers(lhs, rhs),
            }
            .ok_or_else(|| mismatch(op, lhs, rhs))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => match rhs {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| equals(item, lhs)))),
            Value::Map(map) => match lhs {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(mismatch(op, lhs, rhs)),
            },
            Value::String(haystack) => match lhs {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                _ => Err(mismatch(op, lhs, rhs)),
            },
            Value::Null => Ok(Value::Bool(false)),
            _ => Err(mismatch(op, lhs, rhs)),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            _ => arithmetic(op, lhs, rhs),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, lhs, rhs),
    }
}

fn call(func: Func, arg: &Value) -> Result<Value, ExprError> {
    let bad = || {
        ExprError::type_error(format!("{}() does not accept a {}", func.name(), arg.type_name()))
    };
    match func {
        Func::Len => {
            let len = match arg {
                Value::String(s) => s.chars().count(),
                Value::Bytes(b) => b.len(),
                Value::Array(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Null => 0,
                _ => return Err(bad()),
            };
            Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
        }
        Func::Lower => arg.as_str().map(|s| Value::from(s.to_lowercase())).ok_or_else(bad),
        Func::Upper => arg.as_str().map(|s| Value::from(s.to_uppercase())).ok_or_else(bad),
        Func::String => Ok(Value::String(arg.to_display_string())),
        Func::Int => match arg {
            Value::Int(i) => Ok(Value::Int(*i)),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::String(s) => s.trim().parse().map(Value::Int).map_err(|_| bad()),
            _ => Err(bad()),
        },
        Func::Float => match arg {
            Value::String(s) => s.trim().parse().map(Value::Float).map_err(|_| bad()),
            other => other.as_f64().map(Value::Float).ok_or_else(bad),
        },
    }
}
