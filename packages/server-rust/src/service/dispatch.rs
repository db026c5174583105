use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use relaybus_core::{BusError, Value};
use tower::Service;

use super::invocation::Invocation;
use crate::engine::Engine;

/// Innermost service of the stack: runs the invocation on the engine.
#[derive(Debug, Clone)]
pub struct EngineService {
    engine: Arc<Engine>,
}

impl EngineService {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl Service<Invocation> for EngineService {
    type Response = Value;
    type Error = BusError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, BusError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let engine = Arc::clone(&self.engine);
        Box::pin(async move { engine.invoke(invocation).await })
    }
}
