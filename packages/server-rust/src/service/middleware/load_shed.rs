//! Caps how many invocations the engine runs at once.
//!
//! An invocation arriving while `max_concurrent_invocations` others are in
//! flight fails straight away with `resource_exhausted` (HTTP 429) and never
//! reaches schema coercion or the pipeline. Nothing is queued, so callers
//! see overload immediately and can back off.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use relaybus_core::{BusError, ErrorCode, Value};
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::service::invocation::Invocation;

/// One semaphore shared by every service the layer wraps, so clones of the
/// invocation stack draw from the same budget.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Invocation> for LoadShedService<S>
where
    S: Service<Invocation, Response = Value, Error = BusError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = BusError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, BusError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            let handler = invocation.handler.to_string();
            tracing::warn!(%handler, request_id = %invocation.ctx.request_id, "invocation shed");
            metrics::counter!("relaybus_invocations_shed_total", "handler" => handler.clone()).increment(1);
            return Box::pin(async move {
                Err(BusError::new(
                    ErrorCode::ResourceExhausted,
                    format!("engine overloaded, {handler} rejected; try again later"),
                ))
            });
        };

        let fut = self.inner.call(invocation);
        Box::pin(async move {
            // Released only when the pipeline or module call settles.
            let result = fut.await;
            drop(permit);
            result
        })
    }
}
