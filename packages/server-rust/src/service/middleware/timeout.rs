//! Whole-invocation deadline.
//!
//! The deadline covers schema coercion, every pipeline step including its
//! retries and breaker waits, and any mesh fallthrough. An invocation that
//! carries its own timeout (`Invocation::with_timeout`) uses it instead of
//! `default_timeout`. On expiry the in-flight future is dropped, which
//! cancels the running step, and the caller gets `deadline_exceeded`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use relaybus_core::{BusError, ErrorCode, Value};
use tower::{Layer, Service};

use crate::service::invocation::Invocation;

#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    default: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default: Duration) -> Self {
        Self { default }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default: self.default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default: Duration,
}

impl<S> Service<Invocation> for TimeoutService<S>
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
        let duration = invocation.timeout.unwrap_or(self.default);
        let handler = invocation.handler.to_string();
        let fut = self.inner.call(invocation);
        Box::pin(async move {
            let Ok(result) = tokio::time::timeout(duration, fut).await else {
                tracing::debug!(%handler, ?duration, "invocation deadline passed");
                return Err(BusError::new(
                    ErrorCode::DeadlineExceeded,
                    format!("{handler} timed out after {}ms", duration.as_millis()),
                ));
            };
            result
        })
    }
}
