//! Per-invocation span and metrics.
//!
//! Every step log, mesh hop and breaker transition of an invocation is
//! emitted inside its `invocation` span, keyed by interface, operation and
//! request id. The outcome is `ok` or the error code name, so a
//! `not_found` from a provider and a shed `resource_exhausted` are counted
//! apart in `relaybus_invocations_total`. Latency goes to
//! `relaybus_invocation_duration_seconds`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use relaybus_core::{BusError, Value};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::invocation::Invocation;

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
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
        let interface = invocation.handler.interface.clone();
        let operation = invocation.handler.operation.clone();

        let span = info_span!(
            "invocation",
            interface = %interface,
            operation = %operation,
            request_id = %invocation.ctx.request_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.code.as_str(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    "relaybus_invocations_total",
                    "interface" => interface.clone(),
                    "operation" => operation.clone(),
                    "outcome" => outcome,
                )
                .increment(1);
                metrics::histogram!(
                    "relaybus_invocation_duration_seconds",
                    "interface" => interface,
                    "operation" => operation,
                )
                .record(elapsed.as_secs_f64());

                tracing::info!(duration_ms, outcome, "invocation complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
