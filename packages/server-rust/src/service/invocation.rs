use std::time::Duration;

use relaybus_core::{Handler, RequestContext, Value};

/// One request for an interface or provider operation, as handed to the
/// invocation service stack by a transport.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub ctx: RequestContext,
    pub handler: Handler,
    pub input: Value,
    /// Overrides the stack's default deadline.
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Builds an invocation whose context carries `handler`.
    #[must_use]
    pub fn new(ctx: RequestContext, handler: Handler, input: Value) -> Self {
        Self {
            ctx: ctx.with_handler(handler.clone()),
            handler,
            input,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
