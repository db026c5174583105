//! Small expression language used by filters, route guards, circuit
//! breaker trip conditions and value-producing steps.
//!
//! Expressions are compiled once when configuration is loaded and evaluated
//! per request against a [`Scope`] (normally the request [`Data`]).
//!
//! Supported syntax:
//! - literals: integers, floats, `'single'` or `"double"` quoted strings,
//!   `true`, `false`, `null` (`nil`), `[a, b]`, `{key: value}`
//! - variables and access: `input.name`, `items[0]`, `map['key']`, `$`
//! - operators: `!`/`not`, unary `-`, `* / %`, `+ -`, `< <= > >= in`,
//!   `== !=`, `&&`/`and`, `||`/`or`, `cond ? a : b`
//! - functions: `len`, `lower`, `upper`, `string`, `int`, `float`
//!
//! Unknown variables and missing fields evaluate to `null`. Logical
//! operators require boolean operands.
//!
//! [`Data`]: crate::data::Data

mod eval;
mod lexer;
mod parser;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use eval::Scope;

use crate::types::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("parse error at {pos}: {message}")]
    Parse { pos: usize, message: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("expression must evaluate to a bool, found {found}")]
    NotBoolean { found: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
}

impl ExprError {
    pub(crate) fn parse(pos: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            pos,
            message: message.into(),
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }
}

/// A compiled expression.
#[derive(Clone, PartialEq)]
pub struct Expr {
    source: String,
    root: parser::Node,
}

impl Expr {
    /// Parses `source` into a reusable expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::Parse`] or [`ExprError::UnknownFunction`] for
    /// malformed input.
    pub fn compile(source: impl Into<String>) -> Result<Self, ExprError> {
        let source = source.into();
        let root = parser::parse(&source)?;
        Ok(Self { source, root })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// # Errors
    ///
    /// Returns an error on operand type mismatches or division by zero.
    pub fn eval(&self, scope: &dyn Scope) -> Result<Value, ExprError> {
        eval::eval(&self.root, scope).map(std::borrow::Cow::into_owned)
    }

    /// Evaluates a condition.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::NotBoolean`] if the result is not a bool, or any
    /// evaluation error.
    pub fn eval_bool(&self, scope: &dyn Scope) -> Result<bool, ExprError> {
        let value = eval::eval(&self.root, scope)?;
        value.as_bool().ok_or(ExprError::NotBoolean {
            found: value.type_name(),
        })
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expr").field(&self.source).finish()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Expr {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::compile(source).map_err(serde::de::Error::custom)
    }
}
