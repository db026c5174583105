//! `http`: calls an HTTP endpoint through the shared client.
//!
//! The URL and header values are templates. The optional body expression
//! is encoded with `codec` (default `json`); the response is decoded with
//! the codec matching its `Content-Type`, falling back to `codec`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{
    Action, ActionError, Codec, Codecs, Data, ErrorCode, Expr, Flow, RequestContext, Value,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::Deserialize;

use super::decode::CODECS;
use crate::registry::{decode_config, LoadError, NamedLoader};
use crate::template::Template;

pub const NAME: &str = "http";

/// Capability name of the shared `reqwest::Client`.
pub const HTTP_CLIENT: &str = "client:http";

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: Template,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<Expr>,
    #[serde(default)]
    headers: BTreeMap<String, Template>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default = "default_codec")]
    codec: String,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_codec() -> String {
    "json".to_string()
}

struct Http {
    client: Arc<reqwest::Client>,
    codecs: Arc<Codecs>,
    codec: Arc<dyn Codec>,
    method: Method,
    url: Template,
    headers: BTreeMap<String, Template>,
    body: Option<Expr>,
    output: Option<String>,
}

#[must_use]
pub fn loader() -> NamedLoader {
    NamedLoader::new(NAME, |with, resolver| {
        let config: HttpConfig = decode_config(NAME, with)?;
        let client: Arc<reqwest::Client> = resolver.resolve(HTTP_CLIENT)?;
        let codecs: Arc<Codecs> = resolver.resolve(CODECS)?;
        let codec = codecs
            .by_name(&config.codec)
            .ok_or_else(|| LoadError::invalid(NAME, format!("unknown codec {:?}", config.codec)))?;
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| LoadError::invalid(NAME, e))?;
        Ok(Arc::new(Http {
            client,
            codecs,
            codec,
            method,
            url: config.url,
            headers: config.headers,
            body: config.body,
            output: config.output,
        }))
    })
}

/// Maps a failed response status onto an error code. Server-side and
/// throttling failures are retriable.
fn status_error(status: reqwest::StatusCode, body: &str) -> ActionError {
    let code = match status.as_u16() {
        400 => ErrorCode::InvalidArgument,
        401 => ErrorCode::Unauthenticated,
        403 => ErrorCode::PermissionDenied,
        404 => ErrorCode::NotFound,
        409 => ErrorCode::AlreadyExists,
        429 => ErrorCode::ResourceExhausted,
        501 => ErrorCode::Unimplemented,
        503 => ErrorCode::Unavailable,
        504 => ErrorCode::DeadlineExceeded,
        _ => ErrorCode::Unknown,
    };
    let error = ActionError::with_code(code, format!("http {status}: {body}"));
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        error.retriable()
    } else {
        error.permanent()
    }
}

#[async_trait]
impl Action for Http {
    async fn call(&self, _ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let url = self.url.render(data)?;
        let mut request = self.client.request(self.method.clone(), &url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.render(data)?);
        }
        if let Some(body) = &self.body {
            let value = body.eval(data)?;
            request = request
                .header(CONTENT_TYPE, self.codec.content_type())
                .body(self.codec.encode(&value)?);
        }

        tracing::debug!(method = %self.method, %url, "http request");
        let response = request.send().await.map_err(|e| {
            ActionError::with_code(ErrorCode::Unavailable, format!("http request failed: {e}")).retriable()
        })?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| {
            ActionError::with_code(ErrorCode::Unavailable, format!("http body failed: {e}")).retriable()
        })?;
        if !status.is_success() {
            return Err(status_error(status, &String::from_utf8_lossy(&bytes)));
        }

        let value = if bytes.is_empty() {
            Value::Null
        } else {
            let codec = content_type
                .as_deref()
                .and_then(|ct| self.codecs.by_content_type(ct))
                .unwrap_or_else(|| Arc::clone(&self.codec));
            codec.decode(&bytes)?
        };
        if let Some(output) = &self.output {
            data.insert(output.as_str(), value.clone());
        }
        Ok(Flow::value(value))
    }
}
