//! `log`: emits an info event through the injected logger. `{}` markers in
//! `format` are replaced by the evaluated `args` in order.

use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{Action, ActionError, Data, Expr, Flow, RequestContext};
use serde::Deserialize;

use crate::logging::{Logger, LOGGER};
use crate::registry::{decode_config, NamedLoader};

pub const NAME: &str = "log";

#[derive(Debug, Deserialize)]
struct LogConfig {
    format: String,
    #[serde(default)]
    args: Vec<Expr>,
}

struct Log {
    logger: Arc<Logger>,
    format: String,
    args: Vec<Expr>,
}

#[must_use]
pub fn loader() -> NamedLoader {
    NamedLoader::new(NAME, |with, resolver| {
        let config: LogConfig = decode_config(NAME, with)?;
        let logger = resolver
            .resolve_optional::<Logger>(LOGGER)?
            .unwrap_or_default();
        Ok(Arc::new(Log {
            logger,
            format: config.format,
            args: config.args,
        }))
    })
}

impl Log {
    fn render(&self, data: &Data) -> Result<String, ActionError> {
        let mut out = String::with_capacity(self.format.len());
        let mut args = self.args.iter();
        let mut pieces = self.format.split("{}").peekable();
        while let Some(piece) = pieces.next() {
            out.push_str(piece);
            if pieces.peek().is_some() {
                match args.next() {
                    Some(arg) => out.push_str(&arg.eval(data)?.to_display_string()),
                    None => out.push_str("{}"),
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Action for Log {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let message = self.render(data)?;
        self.logger.span().in_scope(|| {
            tracing::info!(request_id = %ctx.request_id, "{message}");
        });
        Ok(Flow::next())
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::{Resolver, Value};
    use serde_json::json;

    use super::*;

    fn action(with: serde_json::Value) -> Log {
        let config: LogConfig = decode_config(NAME, &Value::from(with)).unwrap();
        Log {
            logger: Arc::new(Logger::default()),
            format: config.format,
            args: config.args,
        }
    }

    #[test]
    fn interpolates_args_in_order() {
        let log = action(json!({"format": "hello {} ({} years)", "args": ["input.name", "input.age"]}));
        let data = Data::for_request(Value::from(json!({"name": "Ada", "age": 36})), Value::Null, Value::Null);
        assert_eq!(log.render(&data).unwrap(), "hello Ada (36 years)");
    }

    #[test]
    fn missing_args_leave_markers() {
        let log = action(json!({"format": "a {} b {}", "args": ["1"]}));
        assert_eq!(log.render(&Data::new()).unwrap(), "a 1 b {}");
    }

    #[tokio::test]
    async fn loads_without_injected_logger() {
        let with = Value::from(json!({"format": "ok"}));
        let action = loader().load(&with, &Resolver::empty()).unwrap();
        let flow = action.call(&RequestContext::default(), &mut Data::new()).await.unwrap();
        assert_eq!(flow, Flow::next());
    }
}
