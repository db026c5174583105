//! HTTP RPC transport with a deferred startup lifecycle: `new()` builds the
//! invocation stack, `start()` binds the listener, `serve()` accepts
//! requests until the shutdown future resolves, then drains.
//!
//! Routes:
//! - `POST /{interface}/{operation}` -- body decoded by `Content-Type`
//!   (JSON when absent, MessagePack), response encoded the same way.
//!   `Accept: application/x-ndjson` streams the records the operation
//!   pushes, one JSON document per line.
//! - `GET /health` -- `{"status": "ok"}` while serving.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relaybus_core::stream::{channel, ChannelSource};
use relaybus_core::{BusError, Codec, Codecs, ErrorCode, Handler, RequestContext, Source, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{info, warn};

use super::config::HttpConfig;
use super::middleware::build_http_layers;
use super::shutdown::{HealthState, ShutdownController};
use crate::engine::Engine;
use crate::service::{build_invocation_service, Invocation, InvocationService};

const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    service: InvocationService,
    shutdown: Arc<ShutdownController>,
    codecs: Arc<Codecs>,
    stream_buffer: usize,
}

pub struct HttpTransport {
    config: HttpConfig,
    engine: Arc<Engine>,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl HttpTransport {
    #[must_use]
    pub fn new(engine: Arc<Engine>, config: HttpConfig) -> Self {
        Self {
            config,
            engine,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// The routes with HTTP layers applied.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            engine: Arc::clone(&self.engine),
            service: build_invocation_service(Arc::clone(&self.engine), &self.config.engine),
            shutdown: Arc::clone(&self.shutdown),
            codecs: Arc::new(Codecs::with_defaults()),
            stream_buffer: self.config.engine.stream_buffer.max(1),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/{interface}/{operation}", post(rpc_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the bound address, which carries the
    /// OS-assigned port when the configured port is `0`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.address).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "HTTP listener bound");
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Serves until `shutdown` resolves, then waits for in-flight requests
    /// and closes the engine's compute modules.
    ///
    /// # Errors
    ///
    /// Returns an error if [`start`](Self::start) was not called or the
    /// server hits a fatal I/O error.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        self.shutdown.set_ready();
        let ctrl = Arc::clone(&self.shutdown);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                ctrl.trigger_shutdown();
            })
            .await?;

        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all requests drained");
        } else {
            warn!(in_flight = self.shutdown.in_flight_count(), "drain timeout expired");
        }
        self.engine.close().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.shutdown.health_state();
    let status = if health == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({ "status": health.as_str(), "bus": state.engine.id() })),
    )
}

async fn rpc_handler(
    State(state): State<AppState>,
    Path((interface, operation)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _in_flight = state.shutdown.in_flight_guard();

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let Some(codec) = state
        .codecs
        .by_content_type(content_type)
        .filter(|c| matches!(c.content_type(), "application/json" | "application/msgpack"))
    else {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unsupported content type {content_type:?}"),
        )
            .into_response();
    };

    let input = if body.is_empty() {
        Value::Map(BTreeMap::new())
    } else {
        match codec.decode(&body) {
            Ok(value) => value,
            Err(e) => return error_response(codec.as_ref(), &BusError::invalid_argument(e.to_string())),
        }
    };

    let ctx = RequestContext::new(uuid::Uuid::new_v4().to_string());
    let ctx = match state.engine.filters().apply(ctx, &headers) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(codec.as_ref(), &e),
    };
    let handler = Handler::new(interface, operation);

    if accepts_ndjson(&headers) {
        return stream_response(&state, ctx, handler, input);
    }

    let invocation = Invocation::new(ctx.clone(), handler, input);
    match state.service.clone().oneshot(invocation).await {
        Ok(value) => match codec.encode(&value) {
            Ok(bytes) => success_response(&ctx, codec.content_type(), bytes),
            Err(e) => error_response(codec.as_ref(), &BusError::internal(e.to_string())),
        },
        Err(e) => error_response(codec.as_ref(), &e),
    }
}

fn accepts_ndjson(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains(NDJSON))
}

fn success_response(ctx: &RequestContext, content_type: &str, body: Vec<u8>) -> Response {
    let meta = ctx.response();
    let status = meta
        .status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    for (name, value) in &meta.headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
        {
            headers.insert(name, value);
        }
    }
    if let Ok(value) = HeaderValue::try_from(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    response
}

fn error_body(err: &BusError) -> Value {
    serde_json::to_value(err).map_or_else(|_| Value::from(err.message.as_str()), Value::from)
}

fn error_response(codec: &dyn Codec, err: &BusError) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match codec.encode(&error_body(err)) {
        Ok(bytes) => {
            let mut response = (status, bytes).into_response();
            if let Ok(value) = HeaderValue::try_from(codec.content_type()) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(_) => (status, err.message.clone()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

enum Phase {
    Records(ChannelSource, JoinHandle<Result<Value, BusError>>),
    Done,
}

/// Runs the invocation with a sink attached and streams what it pushes.
/// A failed invocation ends the body with an `{"error": ...}` line.
fn stream_response(state: &AppState, ctx: RequestContext, handler: Handler, input: Value) -> Response {
    let (sink, source) = channel(state.stream_buffer);
    let invocation = Invocation::new(ctx.with_sink(Arc::new(sink)), handler, input);
    let task = tokio::spawn(state.service.clone().oneshot(invocation));

    let lines = futures_util::stream::unfold(Phase::Records(source, task), |phase| async move {
        let Phase::Records(source, task) = phase else {
            return None;
        };
        if let Ok(Some(record)) = source.next().await {
            return Some((ndjson_line(&record.value), Phase::Records(source, task)));
        }
        let failure = match task.await {
            Ok(Ok(_)) => return None,
            Ok(Err(e)) => e,
            Err(e) => BusError::new(ErrorCode::Internal, e.to_string()),
        };
        let mut error = BTreeMap::new();
        error.insert("error".to_string(), error_body(&failure));
        Some((ndjson_line(&Value::Map(error)), Phase::Done))
    });

    let body = Body::from_stream(futures_util::StreamExt::map(lines, Ok::<_, Infallible>));
    let mut response = (StatusCode::OK, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    response
}

fn ndjson_line(value: &Value) -> Bytes {
    let json: serde_json::Value = value.clone().into();
    let mut line = serde_json::to_vec(&json).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}
