//! `decode`: turns raw bytes carried in the input into a structured value
//! with a named codec.
//!
//! When the input is a map, the bytes are read from `dataField` (default
//! `data`) and, if `typeField` is set, the result keeps the type tag next to
//! the decoded payload. When the input itself is bytes or text it is decoded
//! directly.

use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{Action, ActionError, Codec, Codecs, Data, ErrorCode, Flow, RequestContext, Value};
use serde::Deserialize;

use crate::registry::{decode_config, LoadError, NamedLoader};

pub const NAME: &str = "decode";

/// Capability name of the [`Codecs`] table.
pub const CODECS: &str = "codec:lookup";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecodeConfig {
    codec: String,
    #[serde(default)]
    type_field: Option<String>,
    #[serde(default = "default_data_field")]
    data_field: String,
}

fn default_data_field() -> String {
    "data".to_string()
}

struct Decode {
    codec: Arc<dyn Codec>,
    type_field: Option<String>,
    data_field: String,
}

#[must_use]
pub fn loader() -> NamedLoader {
    NamedLoader::new(NAME, |with, resolver| {
        let config: DecodeConfig = decode_config(NAME, with)?;
        let codecs: Arc<Codecs> = resolver.resolve(CODECS)?;
        let codec = codecs
            .by_name(&config.codec)
            .ok_or_else(|| LoadError::invalid(NAME, format!("unknown codec {:?}", config.codec)))?;
        Ok(Arc::new(Decode {
            codec,
            type_field: config.type_field,
            data_field: config.data_field,
        }))
    })
}

fn raw_bytes(value: &Value) -> Result<&[u8], ActionError> {
    match value {
        Value::Bytes(b) => Ok(b),
        Value::String(s) => Ok(s.as_bytes()),
        other => Err(ActionError::with_code(
            ErrorCode::InvalidArgument,
            format!("cannot decode a {} value", other.type_name()),
        )
        .permanent()),
    }
}

#[async_trait]
impl Action for Decode {
    async fn call(&self, _ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let input = data.input();
        let Some(map) = input.as_map() else {
            return Ok(Flow::value(self.codec.decode(raw_bytes(&input)?)?));
        };
        let payload = map.get(&self.data_field).unwrap_or(&Value::Null);
        let decoded = self.codec.decode(raw_bytes(payload)?)?;
        let Some(type_field) = &self.type_field else {
            return Ok(Flow::value(decoded));
        };
        let mut out = std::collections::BTreeMap::new();
        out.insert(
            type_field.clone(),
            map.get(type_field).cloned().unwrap_or_default(),
        );
        out.insert(self.data_field.clone(), decoded);
        Ok(Flow::value(Value::Map(out)))
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::{CapabilityTable, Resolver};
    use serde_json::json;

    use super::*;

    fn resolver() -> Resolver {
        let mut table = CapabilityTable::new();
        table.insert(CODECS, Codecs::with_defaults());
        Resolver::from_table(table)
    }

    async fn run(with: serde_json::Value, input: Value) -> Result<Flow, ActionError> {
        let action = loader().load(&Value::from(with), &resolver()).unwrap();
        let mut data = Data::for_request(input, Value::Null, Value::Null);
        action.call(&RequestContext::default(), &mut data).await
    }

    #[tokio::test]
    async fn decodes_bare_bytes() {
        let flow = run(json!({"codec": "json"}), Value::Bytes(br#"{"a":1}"#.to_vec()))
            .await
            .unwrap();
        assert_eq!(flow, Flow::value(Value::from(json!({"a": 1}))));
    }

    #[tokio::test]
    async fn keeps_type_tag_next_to_payload() {
        let mut input = std::collections::BTreeMap::new();
        input.insert("type".to_string(), Value::from("user.created"));
        input.insert("body".to_string(), Value::from(r#"{"id": 9}"#));
        let flow = run(
            json!({"codec": "json", "typeField": "type", "dataField": "body"}),
            Value::Map(input),
        )
        .await
        .unwrap();
        assert_eq!(
            flow,
            Flow::value(Value::from(json!({"type": "user.created", "body": {"id": 9}})))
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() {
        let err = run(json!({"codec": "json"}), Value::from("{nope")).await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::InvalidArgument));
        assert!(!err.is_retriable());
    }

    #[test]
    fn unknown_codec_fails_to_load() {
        let with = Value::from(json!({"codec": "yaml"}));
        assert!(loader().load(&with, &resolver()).is_err());
    }
}
