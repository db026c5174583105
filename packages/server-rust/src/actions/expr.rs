//! `expr` evaluates one expression; `assign` builds a value from a literal
//! and/or a map of expressions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{Action, ActionError, Data, Expr, Flow, RequestContext, Value};
use serde::Deserialize;

use crate::registry::{decode_config, LoadError, NamedLoader};

pub const NAME: &str = "expr";
pub const ASSIGN: &str = "assign";

#[derive(Debug, Deserialize)]
struct ExprConfig {
    value: Expr,
    #[serde(default)]
    to: Option<String>,
}

struct Evaluate {
    value: Expr,
    to: Option<String>,
}

#[must_use]
pub fn loader() -> NamedLoader {
    NamedLoader::new(NAME, |with, _| {
        let config: ExprConfig = decode_config(NAME, with)?;
        Ok(Arc::new(Evaluate {
            value: config.value,
            to: config.to,
        }))
    })
}

#[async_trait]
impl Action for Evaluate {
    async fn call(&self, _ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let value = self.value.eval(data)?;
        if let Some(to) = &self.to {
            data.insert(to.as_str(), value.clone());
        }
        Ok(Flow::value(value))
    }
}

// ---------------------------------------------------------------------------
// assign
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AssignConfig {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    data: BTreeMap<String, Expr>,
    #[serde(default)]
    to: Option<String>,
}

/// Returns `value`, with the evaluated `data` entries merged on top when
/// `value` is a map (or absent).
struct Assign {
    value: Option<Value>,
    data: BTreeMap<String, Expr>,
    to: Option<String>,
}

#[must_use]
pub fn assign_loader() -> NamedLoader {
    NamedLoader::new(ASSIGN, |with, _| {
        let config: AssignConfig = decode_config(ASSIGN, with)?;
        if !config.data.is_empty() && config.value.as_ref().is_some_and(|v| v.as_map().is_none()) {
            return Err(LoadError::invalid(ASSIGN, "`data` requires `value` to be a map"));
        }
        Ok(Arc::new(Assign {
            value: config.value,
            data: config.data,
            to: config.to,
        }))
    })
}

#[async_trait]
impl Action for Assign {
    async fn call(&self, _ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let value = if self.data.is_empty() {
            self.value.clone().unwrap_or_default()
        } else {
            let mut map = self
                .value
                .as_ref()
                .and_then(Value::as_map)
                .cloned()
                .unwrap_or_default();
            for (key, expr) in &self.data {
                map.insert(key.clone(), expr.eval(data)?);
            }
            Value::Map(map)
        };
        if let Some(to) = &self.to {
            data.insert(to.as_str(), value.clone());
        }
        Ok(Flow::value(value))
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::Resolver;
    use serde_json::json;

    use super::*;

    fn data() -> Data {
        Data::for_request(
            Value::from(json!({"first": "Ada", "last": "Lovelace", "age": 36})),
            Value::Null,
            Value::Null,
        )
    }

    #[tokio::test]
    async fn expr_binds_and_returns() {
        let with = Value::from(json!({"value": "input.first + ' ' + input.last", "to": "full"}));
        let action = loader().load(&with, &Resolver::empty()).unwrap();
        let mut data = data();
        let flow = action.call(&RequestContext::default(), &mut data).await.unwrap();
        assert_eq!(flow, Flow::value("Ada Lovelace"));
        assert_eq!(data.get("full"), Some(&Value::from("Ada Lovelace")));
    }

    #[tokio::test]
    async fn assign_merges_expressions_over_literal() {
        let with = Value::from(json!({
            "value": {"kind": "person"},
            "data": {"name": "input.first", "adult": "input.age >= 18"},
            "to": "person"
        }));
        let action = assign_loader().load(&with, &Resolver::empty()).unwrap();
        let mut data = data();
        action.call(&RequestContext::default(), &mut data).await.unwrap();
        assert_eq!(
            data.get("person"),
            Some(&Value::from(json!({"kind": "person", "name": "Ada", "adult": true})))
        );
    }

    #[tokio::test]
    async fn assign_returns_plain_literal() {
        let with = Value::from(json!({"value": [1, 2]}));
        let action = assign_loader().load(&with, &Resolver::empty()).unwrap();
        let flow = action.call(&RequestContext::default(), &mut data()).await.unwrap();
        assert_eq!(flow, Flow::value(Value::from(json!([1, 2]))));
    }

    #[test]
    fn assign_rejects_data_over_scalar() {
        let with = Value::from(json!({"value": 3, "data": {"a": "1"}}));
        assert!(assign_loader().load(&with, &Resolver::empty()).is_err());
    }
}
