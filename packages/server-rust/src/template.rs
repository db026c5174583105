//! String templates with `{{ expression }}` placeholders, compiled once and
//! rendered against any expression scope.

use std::fmt;

use relaybus_core::{Expr, ExprError, Scope};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr(Expr),
}

#[derive(Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    /// Compiles `source`. Text without placeholders renders verbatim.
    ///
    /// # Errors
    ///
    /// Returns an [`ExprError`] for an unterminated placeholder or an
    /// invalid expression inside one.
    pub fn compile(source: impl Into<String>) -> Result<Self, ExprError> {
        let source = source.into();
        let mut parts = Vec::new();
        let mut rest = source.as_str();
        let mut offset = 0;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| ExprError::Parse {
                pos: offset + start,
                message: "unterminated {{ placeholder".to_string(),
            })?;
            parts.push(Part::Expr(Expr::compile(after[..end].trim())?));
            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self { source, parts })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Renders the template. Null values render as empty text.
    ///
    /// # Errors
    ///
    /// Returns the first expression evaluation error.
    pub fn render(&self, scope: &dyn Scope) -> Result<String, ExprError> {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expr(expr) => out.push_str(&expr.eval(scope)?.to_display_string()),
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Template({:?})", self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::compile(source).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use relaybus_core::Value;

    use super::*;

    #[test]
    fn renders_placeholders() {
        let t = Template::compile("http://api/users/{{ input.id }}?q={{upper(input.q)}}").unwrap();
        let scope: BTreeMap<String, Value> = [(
            "input".to_string(),
            Value::from(serde_json::json!({"id": 7, "q": "ada"})),
        )]
        .into_iter()
        .collect();
        assert_eq!(t.render(&scope).unwrap(), "http://api/users/7?q=ADA");
        assert!(!t.is_literal());
    }

    #[test]
    fn literal_and_missing_values() {
        let scope = BTreeMap::<String, Value>::new();
        assert!(Template::compile("plain").unwrap().is_literal());
        assert_eq!(Template::compile("a{{ nope }}b").unwrap().render(&scope).unwrap(), "ab");
        assert!(Template::compile("oops {{ x").is_err());
    }
}
