//! `route`: runs the first (`single`) or every (`multi`) branch whose guard
//! holds. A branch without a guard always matches.

use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{Action, ActionError, Data, Expr, Flow, RequestContext, Value};
use serde::Deserialize;

use crate::config::{PipelineConfig, StepConfig};
use crate::processor::{Pipeline, ProcessorHandle, PROCESSOR};
use crate::registry::{decode_config, NamedLoader};

pub const NAME: &str = "route";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    #[default]
    Single,
    Multi,
}

#[derive(Debug, Deserialize)]
struct RouteConfig {
    #[serde(default)]
    selection: Selection,
    routes: Vec<BranchConfig>,
}

#[derive(Debug, Deserialize)]
struct BranchConfig {
    name: String,
    #[serde(default)]
    when: Option<Expr>,
    then: Vec<StepConfig>,
}

struct Condition {
    name: String,
    when: Option<Expr>,
    pipeline: Arc<Pipeline>,
}

struct Route {
    selection: Selection,
    conditions: Vec<Condition>,
}

#[must_use]
pub fn loader() -> NamedLoader {
    NamedLoader::new(NAME, |with, resolver| {
        let config: RouteConfig = decode_config(NAME, with)?;
        let processor: Arc<ProcessorHandle> = resolver.resolve(PROCESSOR)?;
        let conditions = config
            .routes
            .into_iter()
            .map(|branch| {
                let pipeline = processor.load_pipeline(
                    &branch.name,
                    &PipelineConfig {
                        name: Some(branch.name.clone()),
                        steps: branch.then,
                    },
                )?;
                Ok(Condition {
                    name: branch.name,
                    when: branch.when,
                    pipeline,
                })
            })
            .collect::<Result<Vec<_>, crate::registry::LoadError>>()?;
        Ok(Arc::new(Route {
            selection: config.selection,
            conditions,
        }))
    })
}

#[async_trait]
impl Action for Route {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let mut result: Option<Value> = None;
        for condition in &self.conditions {
            let matched = match &condition.when {
                Some(guard) => guard.eval_bool(data)?,
                None => true,
            };
            if !matched {
                continue;
            }
            tracing::debug!(route = %condition.name, "route matched");
            result = condition.pipeline.run(ctx, data).await?.into_value();
            if self.selection == Selection::Single {
                break;
            }
        }
        Ok(Flow::Continue(result))
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::CapabilityTable;
    use serde_json::json;

    use super::*;
    use crate::actions::testing;

    const ROUTES: &str = r"
routes:
  - name: A
    when: input.path == 'A'
    then:
      - uses: expr
        with: { value: '''a''', to: ran_a }
  - name: B
    when: input.path == 'B' || input.all == true
    then:
      - uses: expr
        with: { value: '''b''', to: ran_b }
  - name: default
    then:
      - uses: expr
        with: { value: '''default''', to: ran_default }
";

    async fn run(selection: &str, input: serde_json::Value) -> (Flow, Data) {
        let with = format!("selection: {selection}\n{ROUTES}");
        let (_processor, action) = testing::load("{}", NAME, &with, CapabilityTable::new());
        let mut data = Data::for_request(Value::from(input), Value::Null, Value::Null);
        let flow = action.call(&RequestContext::default(), &mut data).await.unwrap();
        (flow, data)
    }

    #[tokio::test]
    async fn single_runs_exactly_the_first_match() {
        let (flow, data) = run("single", json!({"path": "B", "all": true})).await;
        assert_eq!(flow, Flow::value("b"));
        assert!(!data.contains_key("ran_a"));
        assert!(data.contains_key("ran_b"));
        assert!(!data.contains_key("ran_default"));
    }

    #[tokio::test]
    async fn single_falls_back_to_unguarded_branch() {
        let (flow, _) = run("single", json!({"path": "Z"})).await;
        assert_eq!(flow, Flow::value("default"));
    }

    #[tokio::test]
    async fn multi_runs_every_match_in_order() {
        let (flow, data) = run("multi", json!({"path": "A", "all": true})).await;
        assert_eq!(flow, Flow::value("default"));
        assert!(data.contains_key("ran_a"));
        assert!(data.contains_key("ran_b"));
        assert!(data.contains_key("ran_default"));
    }

    #[tokio::test]
    async fn non_boolean_guard_is_an_error() {
        let with = "routes:\n  - name: bad\n    when: input.path\n    then: []\n";
        let (_processor, action) = testing::load("{}", NAME, with, CapabilityTable::new());
        let mut data = Data::for_request(Value::from(json!({"path": "A"})), Value::Null, Value::Null);
        assert!(action.call(&RequestContext::default(), &mut data).await.is_err());
    }
}
