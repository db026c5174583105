//! Encode/decode contract used at system boundaries, plus the built-in
//! codecs and the name/content-type lookup table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("{codec} cannot encode a {found} value")]
    Unsupported { codec: &'static str, found: &'static str },
    #[error("invalid utf-8 text: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Translates between raw bytes and [`Value`].
pub trait Codec: Send + Sync {
    /// MIME type produced by [`Codec::encode`].
    fn content_type(&self) -> &str;

    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// # Errors
    ///
    /// Returns an error if `bytes` are not valid for this format.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let json: serde_json::Value = value.clone().into();
        Ok(serde_json::to_vec(&json)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice::<serde_json::Value>(bytes)?.into())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn content_type(&self) -> &str {
        "application/msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// UTF-8 text. Scalars are rendered, containers are rejected.
#[derive(Debug, Clone)]
pub struct TextCodec {
    content_type: &'static str,
}

impl TextCodec {
    #[must_use]
    pub fn plain() -> Self {
        Self {
            content_type: "text/plain",
        }
    }

    #[must_use]
    pub fn html() -> Self {
        Self {
            content_type: "text/html",
        }
    }
}

impl Codec for TextCodec {
    fn content_type(&self) -> &str {
        self.content_type
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value {
            Value::Array(_) | Value::Map(_) => Err(CodecError::Unsupported {
                codec: "text",
                found: value.type_name(),
            }),
            Value::Bytes(b) => Ok(b.clone()),
            other => Ok(other.to_display_string().into_bytes()),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(Value::String(String::from_utf8(bytes.to_vec())?))
    }
}

/// Raw bytes passthrough.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Null => Ok(Vec::new()),
            other => Err(CodecError::Unsupported {
                codec: "bytes",
                found: other.type_name(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(Value::Bytes(bytes.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Codecs table
// ---------------------------------------------------------------------------

/// Immutable lookup of codecs by name and by content type.
#[derive(Clone, Default)]
pub struct Codecs {
    by_name: HashMap<String, Arc<dyn Codec>>,
    by_content_type: HashMap<String, Arc<dyn Codec>>,
}

impl Codecs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON, MessagePack, text, HTML and bytes.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut codecs = Self::new();
        codecs.register("json", Arc::new(JsonCodec));
        codecs.register("msgpack", Arc::new(MsgPackCodec));
        codecs.register("text", Arc::new(TextCodec::plain()));
        codecs.register("html", Arc::new(TextCodec::html()));
        codecs.register("bytes", Arc::new(BytesCodec));
        codecs
    }

    /// Registers `codec` under `name` and under its content type. The first
    /// codec registered for a content type keeps it.
    pub fn register(&mut self, name: impl Into<String>, codec: Arc<dyn Codec>) {
        self.by_content_type
            .entry(codec.content_type().to_string())
            .or_insert_with(|| Arc::clone(&codec));
        self.by_name.insert(name.into(), codec);
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.by_name.get(name).cloned()
    }

    /// Looks up by MIME type, ignoring parameters such as `; charset=utf-8`.
    #[must_use]
    pub fn by_content_type(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.by_content_type.get(&essence).cloned()
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("Codecs").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_and_msgpack_agree_on_structure() {
        let v = Value::from(json!({"name": "Ada", "tags": [1, 2]}));
        let codecs = Codecs::with_defaults();
        for name in ["json", "msgpack"] {
            let codec = codecs.by_name(name).unwrap();
            let bytes = codec.encode(&v).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), v, "{name}");
        }
    }

    #[test]
    fn content_type_lookup_ignores_parameters() {
        let codecs = Codecs::with_defaults();
        let codec = codecs
            .by_content_type("Application/JSON; charset=utf-8")
            .unwrap();
        assert_eq!(codec.content_type(), "application/json");
        assert!(codecs.by_content_type("application/xml").is_none());
    }

    #[test]
    fn text_rejects_containers() {
        let text = TextCodec::plain();
        assert_eq!(text.encode(&Value::Int(5)).unwrap(), b"5");
        assert!(text.encode(&Value::Array(vec![])).is_err());
        assert_eq!(text.decode(b"hi").unwrap(), Value::from("hi"));
    }
}
