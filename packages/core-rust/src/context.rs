use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handler::Handler;
use crate::stream::{Sink, Source};
use crate::types::Value;

/// Response metadata a step may set for the transport (status, headers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
}

/// Per-request execution context carrying operation identity, caller
/// claims, the optional stream endpoints and writable response metadata.
///
/// Created once per inbound request and passed by reference down every
/// step and nested pipeline of that request. Never shared across requests.
#[derive(Clone, Default)]
pub struct RequestContext {
    /// Correlation identifier for logs.
    pub request_id: String,
    /// Operation being served, when known.
    pub handler: Option<Handler>,
    /// Identity claims of the caller (`null` when anonymous).
    pub claims: Value,
    /// Records produced upstream, for consuming steps.
    pub source: Option<Arc<dyn Source>>,
    /// Destination for records, for producing steps.
    pub sink: Option<Arc<dyn Sink>>,
    response: Arc<Mutex<ResponseMeta>>,
}

impl RequestContext {
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_claims(mut self, claims: Value) -> Self {
        self.claims = claims;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Copy of this context with the stream endpoints removed, for nested
    /// calls that must not consume the caller's stream.
    #[must_use]
    pub fn without_streams(&self) -> Self {
        Self {
            source: None,
            sink: None,
            ..self.clone()
        }
    }

    pub fn set_status(&self, status: u16) {
        self.response.lock().status = Some(status);
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.response.lock().headers.insert(name.into(), value.into());
    }

    /// Snapshot of the response metadata written so far.
    #[must_use]
    pub fn response(&self) -> ResponseMeta {
        self.response.lock().clone()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("handler", &self.handler)
            .field("claims", &self.claims)
            .field("source", &self.source.is_some())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::channel;

    #[test]
    fn response_meta_is_shared_between_clones() {
        let ctx = RequestContext::new("r1");
        let nested = ctx.without_streams();
        nested.set_status(201);
        nested.set_header("x-bus", "1");
        let meta = ctx.response();
        assert_eq!(meta.status, Some(201));
        assert_eq!(meta.headers.get("x-bus").map(String::as_str), Some("1"));
    }

    #[test]
    fn without_streams_drops_endpoints() {
        let (sink, source) = channel(1);
        let ctx = RequestContext::new("r2")
            .with_sink(Arc::new(sink))
            .with_source(Arc::new(source))
            .with_handler(Handler::new("I", "O"));
        let nested = ctx.without_streams();
        assert!(nested.sink.is_none() && nested.source.is_none());
        assert_eq!(nested.handler, ctx.handler);
    }
}
