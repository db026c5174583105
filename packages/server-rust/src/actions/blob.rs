//! `blob/read` and `blob/write` against a [`MemoryBlob`] resource.
//!
//! An object holds encoded records joined by a delimiter (default `\n`).
//! `blob/read` pushes each decoded record into the request sink when one is
//! present, otherwise returns them as an array. `blob/write` drains the
//! request source when one is present, otherwise writes `data` (an array is
//! written as one record per element).

use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::data::keys;
use relaybus_core::{
    Action, ActionError, Codec, Codecs, Data, ErrorCode, Expr, Flow, Record, RequestContext, Resolver,
    Sink, Source, StreamError, Value,
};
use serde::Deserialize;

use super::decode::CODECS;
use crate::registry::{decode_config, LoadError, NamedLoader};
use crate::resource::{MemoryBlob, Resources, RESOURCES};
use crate::template::Template;

pub const READ: &str = "blob/read";
pub const WRITE: &str = "blob/write";

#[derive(Debug, Deserialize)]
struct BlobConfig {
    resource: String,
    key: Template,
    #[serde(default = "default_codec")]
    codec: String,
    #[serde(default = "default_delimiter")]
    delimiter: String,
    /// Written value when no source is attached. Defaults to `$`.
    #[serde(default)]
    data: Option<Expr>,
}

fn default_codec() -> String {
    "json".to_string()
}

fn default_delimiter() -> String {
    "\n".to_string()
}

struct Blob {
    blob: Arc<MemoryBlob>,
    codec: Arc<dyn Codec>,
    key: Template,
    delimiter: Vec<u8>,
    data: Option<Expr>,
}

fn load(action: &'static str, with: &Value, resolver: &Resolver) -> Result<Blob, LoadError> {
    let config: BlobConfig = decode_config(action, with)?;
    let resources: Arc<Resources> = resolver.resolve(RESOURCES)?;
    let codecs: Arc<Codecs> = resolver.resolve(CODECS)?;
    let codec = codecs
        .by_name(&config.codec)
        .ok_or_else(|| LoadError::invalid(action, format!("unknown codec {:?}", config.codec)))?;
    if config.delimiter.is_empty() {
        return Err(LoadError::invalid(action, "delimiter must not be empty"));
    }
    Ok(Blob {
        blob: resources.get::<MemoryBlob>(&config.resource)?,
        codec,
        key: config.key,
        delimiter: config.delimiter.into_bytes(),
        data: config.data,
    })
}

#[must_use]
pub fn read_loader() -> NamedLoader {
    NamedLoader::new(READ, |with, resolver| Ok(Arc::new(BlobRead(load(READ, with, resolver)?))))
}

#[must_use]
pub fn write_loader() -> NamedLoader {
    NamedLoader::new(WRITE, |with, resolver| Ok(Arc::new(BlobWrite(load(WRITE, with, resolver)?))))
}

/// Splits on `delimiter`, ignoring a trailing delimiter and empty chunks.
fn split<'a>(bytes: &'a [u8], delimiter: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut rest = bytes;
    std::iter::from_fn(move || loop {
        if rest.is_empty() {
            return None;
        }
        let (chunk, next) = match rest.windows(delimiter.len()).position(|w| w == delimiter) {
            Some(at) => (&rest[..at], &rest[at + delimiter.len()..]),
            None => (rest, &rest[rest.len()..]),
        };
        rest = next;
        if !chunk.is_empty() {
            return Some(chunk);
        }
    })
}

// ---------------------------------------------------------------------------
// blob/read
// ---------------------------------------------------------------------------

struct BlobRead(Blob);

#[async_trait]
impl Action for BlobRead {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let blob = &self.0;
        let key = blob.key.render(data)?;
        let bytes = blob.blob.get(&key).ok_or_else(|| {
            ActionError::with_code(ErrorCode::NotFound, format!("object {key:?} not found")).permanent()
        })?;

        let Some(sink) = &ctx.sink else {
            let records = split(&bytes, &blob.delimiter)
                .map(|chunk| blob.codec.decode(chunk))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Flow::value(Value::Array(records)));
        };

        let mut count = 0_i64;
        for chunk in split(&bytes, &blob.delimiter) {
            if sink.is_cancelled() {
                tracing::debug!(%key, count, "blob read cancelled by consumer");
                break;
            }
            let value = match blob.codec.decode(chunk) {
                Ok(value) => value,
                Err(e) => {
                    let error = ActionError::from(e);
                    sink.error(StreamError::Failed(error.message.clone())).await;
                    return Err(error);
                }
            };
            match sink.next(Record::new(value).with_metadata("key", key.as_str())).await {
                Ok(()) => count += 1,
                Err(StreamError::Cancelled) => {
                    tracing::debug!(%key, count, "blob read cancelled by consumer");
                    break;
                }
                Err(e) => {
                    sink.error(e.clone()).await;
                    return Err(e.into());
                }
            }
        }
        sink.complete();
        Ok(Flow::value(count))
    }
}

// ---------------------------------------------------------------------------
// blob/write
// ---------------------------------------------------------------------------

struct BlobWrite(Blob);

impl BlobWrite {
    fn push(&self, out: &mut Vec<u8>, value: &Value) -> Result<(), ActionError> {
        if !out.is_empty() {
            out.extend_from_slice(&self.0.delimiter);
        }
        out.extend_from_slice(&self.0.codec.encode(value)?);
        Ok(())
    }
}

#[async_trait]
impl Action for BlobWrite {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let key = self.0.key.render(data)?;
        let mut out = Vec::new();
        let mut count = 0_i64;

        if let Some(source) = &ctx.source {
            while let Some(record) = source.next().await? {
                self.push(&mut out, &record.value)?;
                count += 1;
            }
        } else {
            let value = match &self.0.data {
                Some(expr) => expr.eval(data)?,
                None => data.get(keys::DOLLAR).cloned().unwrap_or_default(),
            };
            match &value {
                Value::Array(items) => {
                    for item in items {
                        self.push(&mut out, item)?;
                        count += 1;
                    }
                }
                single => {
                    self.push(&mut out, single)?;
                    count += 1;
                }
            }
        }

        tracing::debug!(%key, count, bytes = out.len(), "blob written");
        self.0.blob.put(key, out);
        Ok(Flow::value(count))
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::stream::{channel, collect};
    use relaybus_core::CapabilityTable;
    use serde_json::json;

    use super::*;

    fn resolver(blob: Arc<MemoryBlob>) -> Resolver {
        let mut resources = Resources::new();
        resources.insert_capability("bucket", blob);
        let mut table = CapabilityTable::new();
        table.insert(RESOURCES, resources);
        table.insert(CODECS, Codecs::with_defaults());
        Resolver::from_table(table)
    }

    fn with(extra: serde_json::Value) -> Value {
        let mut base = json!({"resource": "bucket", "key": "{{ input.key }}"});
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        Value::from(base)
    }

    fn data() -> Data {
        Data::for_request(Value::from(json!({"key": "people"})), Value::Null, Value::Null)
    }

    #[test]
    fn split_skips_empty_chunks() {
        let chunks: Vec<_> = split(b"a\n\nbc\n", b"\n").collect();
        assert_eq!(chunks, vec![&b"a"[..], &b"bc"[..]]);
        assert_eq!(split(b"x||y", b"||").count(), 2);
    }

    #[tokio::test]
    async fn write_then_read_without_streams() {
        let blob = Arc::new(MemoryBlob::new());
        let resolver = resolver(blob.clone());
        let ctx = RequestContext::default();

        let write = write_loader()
            .load(&with(json!({"data": "[{n: 1}, {n: 2}]"})), &resolver)
            .unwrap();
        assert_eq!(write.call(&ctx, &mut data()).await.unwrap(), Flow::value(2));
        assert_eq!(blob.get("people"), Some(b"{\"n\":1}\n{\"n\":2}".to_vec()));

        let read = read_loader().load(&with(json!({})), &resolver).unwrap();
        assert_eq!(
            read.call(&ctx, &mut data()).await.unwrap(),
            Flow::value(Value::from(json!([{"n": 1}, {"n": 2}])))
        );
    }

    #[tokio::test]
    async fn read_streams_into_sink_with_backpressure() {
        let blob = Arc::new(MemoryBlob::new());
        let lines: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        blob.put("people", lines.join("\n").into_bytes());
        let resolver = resolver(blob);

        let (sink, source) = channel(4);
        let ctx = RequestContext::default().with_sink(Arc::new(sink));
        let read = read_loader().load(&with(json!({})), &resolver).unwrap();
        let producer = tokio::spawn(async move { read.call(&ctx, &mut data()).await });

        let records = collect(&source).await.unwrap();
        assert_eq!(producer.await.unwrap().unwrap(), Flow::value(50));
        let values: Vec<Value> = records.into_iter().map(|r| r.value).collect();
        assert_eq!(values, (0..50).map(Value::from).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn consumer_cancel_stops_read_without_error() {
        let blob = Arc::new(MemoryBlob::new());
        let lines: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        blob.put("people", lines.join("\n").into_bytes());
        let resolver = resolver(blob);

        let (sink, source) = channel(1);
        let ctx = RequestContext::default().with_sink(Arc::new(sink));
        let read = read_loader().load(&with(json!({})), &resolver).unwrap();
        let producer = tokio::spawn(async move { read.call(&ctx, &mut data()).await });

        assert_eq!(source.next().await.unwrap().unwrap().value, Value::Int(0));
        source.cancel();
        let flow = producer.await.unwrap().unwrap();
        let Flow::Continue(Some(Value::Int(count))) = flow else {
            panic!("unexpected flow {flow:?}");
        };
        assert!(count < 50, "read kept going after cancel: {count}");
        // Records already queued still drain, then the stream ends cleanly.
        while source.next().await.unwrap().is_some() {}
    }

    #[tokio::test]
    async fn write_drains_source() {
        let blob = Arc::new(MemoryBlob::new());
        let resolver = resolver(blob.clone());
        let (sink, source) = channel(2);
        tokio::spawn(async move {
            for word in ["a", "b", "c"] {
                sink.next(Record::new(word)).await.unwrap();
            }
            sink.complete();
        });
        let ctx = RequestContext::default().with_source(Arc::new(source));
        let write = write_loader()
            .load(&with(json!({"codec": "text", "delimiter": ","})), &resolver)
            .unwrap();
        assert_eq!(write.call(&ctx, &mut data()).await.unwrap(), Flow::value(3));
        assert_eq!(blob.get("people"), Some(b"a,b,c".to_vec()));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let resolver = resolver(Arc::new(MemoryBlob::new()));
        let read = read_loader().load(&with(json!({})), &resolver).unwrap();
        let err = read.call(&RequestContext::default(), &mut data()).await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::NotFound));
    }
}
