//! `filter`: stops the pipeline when its condition is false.

use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{Action, ActionError, Data, Expr, Flow, RequestContext};
use serde::Deserialize;

use crate::registry::{decode_config, NamedLoader};

pub const NAME: &str = "filter";

#[derive(Debug, Deserialize)]
struct FilterConfig {
    condition: Expr,
}

struct Filter {
    condition: Expr,
}

#[must_use]
pub fn loader() -> NamedLoader {
    NamedLoader::new(NAME, |with, _| {
        let config: FilterConfig = decode_config(NAME, with)?;
        Ok(Arc::new(Filter {
            condition: config.condition,
        }))
    })
}

#[async_trait]
impl Action for Filter {
    async fn call(&self, _ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        if self.condition.eval_bool(data)? {
            Ok(Flow::next())
        } else {
            tracing::debug!(condition = %self.condition, "filter rejected request");
            Ok(Flow::Stop(None))
        }
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::{Resolver, Value};
    use serde_json::json;

    use super::*;

    async fn run(condition: &str, input: serde_json::Value) -> Result<Flow, ActionError> {
        let with = Value::from(json!({ "condition": condition }));
        let action = loader().load(&with, &Resolver::empty()).unwrap();
        let mut data = Data::for_request(Value::from(input), Value::Null, Value::Null);
        action.call(&RequestContext::default(), &mut data).await
    }

    #[tokio::test]
    async fn passes_or_stops() {
        assert_eq!(
            run("input.enabled == true", json!({"enabled": true})).await.unwrap(),
            Flow::next()
        );
        assert!(run("input.enabled == true", json!({"enabled": false}))
            .await
            .unwrap()
            .is_stop());
    }

    #[tokio::test]
    async fn non_boolean_condition_is_an_error() {
        assert!(run("input.name", json!({"name": "x"})).await.is_err());
    }

    #[test]
    fn invalid_expression_fails_to_load() {
        let with = Value::from(json!({ "condition": "input.(" }));
        assert!(loader().load(&with, &Resolver::empty()).is_err());
    }
}
