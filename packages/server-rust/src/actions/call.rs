//! Forwarding actions: run another configured pipeline or operation against
//! the caller's data, or re-dispatch through the whole engine.

use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::data::keys;
use relaybus_core::{Action, ActionError, Data, ErrorCode, Expr, Flow, Handler, RequestContext};
use serde::Deserialize;

use crate::engine::{EngineHandle, INVOKER};
use crate::processor::{ProcessorHandle, PROCESSOR};
use crate::registry::{decode_config, NamedLoader};

pub const CALL_PIPELINE: &str = "call_pipeline";
pub const CALL_PROVIDER: &str = "call_provider";
pub const CALL_INTERFACE: &str = "call_interface";
pub const INVOKE: &str = "invoke";

fn not_found(what: &str, name: &str) -> ActionError {
    ActionError::with_code(ErrorCode::NotFound, format!("{what} {name} not found"))
}

// ---------------------------------------------------------------------------
// call_pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CallPipelineConfig {
    pipeline: String,
}

struct CallPipeline {
    processor: Arc<ProcessorHandle>,
    pipeline: String,
}

#[must_use]
pub fn pipeline_loader() -> NamedLoader {
    NamedLoader::new(CALL_PIPELINE, |with, resolver| {
        let config: CallPipelineConfig = decode_config(CALL_PIPELINE, with)?;
        Ok(Arc::new(CallPipeline {
            processor: resolver.resolve(PROCESSOR)?,
            pipeline: config.pipeline,
        }))
    })
}

#[async_trait]
impl Action for CallPipeline {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let outcome = self
            .processor
            .pipeline(ctx, &self.pipeline, data)
            .await?
            .ok_or_else(|| not_found("pipeline", &self.pipeline))?;
        Ok(Flow::Continue(outcome.into_value()))
    }
}

// ---------------------------------------------------------------------------
// call_provider / call_interface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CallOperationConfig {
    handler: Handler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    Provider,
    Interface,
}

struct CallOperation {
    processor: Arc<ProcessorHandle>,
    namespace: Namespace,
    handler: Handler,
}

fn operation_loader(name: &'static str, namespace: Namespace) -> NamedLoader {
    NamedLoader::new(name, move |with, resolver| {
        let config: CallOperationConfig = decode_config(name, with)?;
        Ok(Arc::new(CallOperation {
            processor: resolver.resolve(PROCESSOR)?,
            namespace,
            handler: config.handler,
        }))
    })
}

#[must_use]
pub fn provider_loader() -> NamedLoader {
    operation_loader(CALL_PROVIDER, Namespace::Provider)
}

#[must_use]
pub fn interface_loader() -> NamedLoader {
    operation_loader(CALL_INTERFACE, Namespace::Interface)
}

#[async_trait]
impl Action for CallOperation {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let outcome = match self.namespace {
            Namespace::Provider => self.processor.provider(ctx, &self.handler, data).await?,
            Namespace::Interface => self.processor.interface(ctx, &self.handler, data).await?,
        };
        let what = match self.namespace {
            Namespace::Provider => "provider",
            Namespace::Interface => "interface",
        };
        let outcome = outcome.ok_or_else(|| not_found(what, &self.handler.to_string()))?;
        Ok(Flow::Continue(outcome.into_value()))
    }
}

// ---------------------------------------------------------------------------
// invoke
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct InvokeConfig {
    /// Defaults to the operation currently being served.
    #[serde(default)]
    handler: Option<Handler>,
    /// Defaults to `input`.
    #[serde(default)]
    value: Option<Expr>,
}

/// Dispatches through the engine as a new request: schema coercion, local
/// pipelines, then compute modules.
struct Invoke {
    engine: Arc<EngineHandle>,
    handler: Option<Handler>,
    value: Option<Expr>,
}

#[must_use]
pub fn invoke_loader() -> NamedLoader {
    NamedLoader::new(INVOKE, |with, resolver| {
        let config: InvokeConfig = decode_config(INVOKE, with)?;
        Ok(Arc::new(Invoke {
            engine: resolver.resolve(INVOKER)?,
            handler: config.handler,
            value: config.value,
        }))
    })
}

#[async_trait]
impl Action for Invoke {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let handler = self
            .handler
            .as_ref()
            .or(ctx.handler.as_ref())
            .cloned()
            .ok_or_else(|| {
                ActionError::with_code(ErrorCode::InvalidArgument, "invoke requires a handler")
                    .permanent()
            })?;
        let input = match &self.value {
            Some(expr) => expr.eval(data)?,
            None => data.get(keys::INPUT).cloned().unwrap_or_default(),
        };
        let nested = ctx.without_streams().with_handler(handler.clone());
        let output = self.engine.dispatch(&nested, &handler, input).await?;
        Ok(Flow::Continue(output))
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::{CapabilityTable, Value};
    use serde_json::json;

    use super::*;
    use crate::actions::testing;

    const BUS: &str = r"
pipelines:
  double:
    steps:
      - uses: expr
        with: { value: 'input.n * 2' }
      - uses: filter
        with: { condition: 'false' }
providers:
  Math:
    Square:
      steps:
        - uses: expr
          with: { value: 'input.n * input.n', to: squared }
";

    fn data(n: i64) -> Data {
        Data::for_request(Value::from(json!({ "n": n })), Value::Null, Value::Null)
    }

    #[tokio::test]
    async fn call_pipeline_shares_data_and_absorbs_stop() {
        let (_p, action) = testing::load(BUS, CALL_PIPELINE, "pipeline: double", CapabilityTable::new());
        let flow = action.call(&RequestContext::default(), &mut data(4)).await.unwrap();
        assert_eq!(flow, Flow::value(8));
    }

    #[tokio::test]
    async fn call_provider_runs_against_caller_data() {
        let (_p, action) =
            testing::load(BUS, CALL_PROVIDER, "handler: Math::Square", CapabilityTable::new());
        let mut data = data(5);
        let flow = action.call(&RequestContext::default(), &mut data).await.unwrap();
        assert_eq!(flow, Flow::value(25));
        assert_eq!(data.get("squared"), Some(&Value::from(25)));
    }

    #[tokio::test]
    async fn missing_target_names_interface_and_operation() {
        let (_p, action) =
            testing::load(BUS, CALL_INTERFACE, "handler: Math::Square", CapabilityTable::new());
        let err = action
            .call(&RequestContext::default(), &mut data(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::NotFound));
        assert!(err.message.contains("Math::Square"));

        let (_p, action) = testing::load(BUS, CALL_PIPELINE, "pipeline: nope", CapabilityTable::new());
        assert!(action.call(&RequestContext::default(), &mut data(1)).await.is_err());
    }

    #[test]
    fn malformed_handler_fails_to_load() {
        let config = crate::config::BusConfig::default();
        let processor = crate::processor::Processor::load(
            &config,
            Arc::new(testing::registry()),
            &relaybus_core::Resolver::empty(),
        )
        .unwrap();
        let with: Value = serde_yaml::from_str("handler: NoSeparator").unwrap();
        assert!(provider_loader().load(&with, processor.resolver()).is_err());
    }
}
