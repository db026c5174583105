//! Transport filters: derive request context (correlation id, caller
//! claims) from inbound headers before dispatch.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use relaybus_core::{BusError, ErrorCode, RequestContext, Value};

/// Capability name of the [`Filters`] chain.
pub const FILTERS: &str = "filter:lookup";

/// Header carrying a caller-supplied correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying caller claims as a JSON object.
pub const CLAIMS_HEADER: &str = "x-relaybus-claims";

pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns a [`BusError`] to reject the request before dispatch.
    fn apply(&self, ctx: RequestContext, headers: &HeaderMap) -> Result<RequestContext, BusError>;
}

/// Adopts the caller's `x-request-id` when present.
#[derive(Debug, Default)]
pub struct RequestIdFilter;

impl Filter for RequestIdFilter {
    fn name(&self) -> &str {
        "request_id"
    }

    fn apply(&self, mut ctx: RequestContext, headers: &HeaderMap) -> Result<RequestContext, BusError> {
        if let Some(id) = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
            if !id.is_empty() {
                ctx.request_id = id.to_string();
            }
        }
        Ok(ctx)
    }
}

/// Reads caller claims from a header holding a JSON object. Claims are
/// expected to have been authenticated by a fronting proxy.
#[derive(Debug)]
pub struct ClaimsHeaderFilter {
    header: HeaderName,
}

impl ClaimsHeaderFilter {
    #[must_use]
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for ClaimsHeaderFilter {
    fn default() -> Self {
        Self::new(HeaderName::from_static(CLAIMS_HEADER))
    }
}

impl Filter for ClaimsHeaderFilter {
    fn name(&self) -> &str {
        "claims_header"
    }

    fn apply(&self, ctx: RequestContext, headers: &HeaderMap) -> Result<RequestContext, BusError> {
        let Some(raw) = headers.get(&self.header) else {
            return Ok(ctx);
        };
        let unauthenticated = |detail: String| {
            BusError::new(ErrorCode::Unauthenticated, format!("malformed {} header: {detail}", self.header))
        };
        let claims: serde_json::Value =
            serde_json::from_slice(raw.as_bytes()).map_err(|e| unauthenticated(e.to_string()))?;
        if !claims.is_object() {
            return Err(unauthenticated("expected a JSON object".to_string()));
        }
        Ok(ctx.with_claims(Value::from(claims)))
    }
}

/// Ordered filter chain applied by the HTTP transport.
#[derive(Clone, Default)]
pub struct Filters {
    filters: Vec<Arc<dyn Filter>>,
}

impl Filters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request id then claims.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut filters = Self::new();
        filters.push(RequestIdFilter);
        filters.push(ClaimsHeaderFilter::default());
        filters
    }

    pub fn push(&mut self, filter: impl Filter + 'static) {
        self.filters.push(Arc::new(filter));
    }

    /// Runs every filter in order, stopping at the first rejection.
    ///
    /// # Errors
    ///
    /// Returns the rejecting filter's error.
    pub fn apply(&self, ctx: RequestContext, headers: &HeaderMap) -> Result<RequestContext, BusError> {
        self.filters.iter().try_fold(ctx, |ctx, filter| {
            filter.apply(ctx, headers).inspect_err(|e| {
                tracing::debug!(filter = filter.name(), error = %e, "request rejected by filter");
            })
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.filters.iter().map(|x| x.name())).finish()
    }
}
