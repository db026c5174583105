//! Dispatch across the local/remote boundary: unserved operations, compute
//! module fallthrough, callbacks into local providers, streaming and
//! invocation deadlines.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use relaybus_core::stream::channel;
use relaybus_core::{BusError, Data, ErrorCode, FnAction, Flow, RequestContext, Source, Value};
use relaybus_server::mesh::{MeshError, NativeModule, Payload};
use relaybus_server::registry::NamedLoader;
use relaybus_server::{build_invocation_service, BusConfig, Components, Engine, EngineConfig, Invocation};
use serde_json::json;
use tower::ServiceExt;

const BUS: &str = r"
id: dispatch
resources:
  archive:
    uses: memory_blob
schemas:
  Inventory:
    Count:
      fields:
        - { name: sku, type: string, required: true }
        - { name: min, type: int }
interfaces:
  Inventory:
    Count:
      steps:
        - uses: expr
          with: { value: '{sku: input.sku, min: input.min}' }
    Import:
      steps:
        - uses: blob/write
          with: { resource: archive, key: lines, data: input.lines }
    Export:
      steps:
        - uses: blob/read
          with: { resource: archive, key: lines }
    Archive:
      steps:
        - uses: blob/write
          with: { resource: archive, key: repriced }
    Archived:
      steps:
        - uses: blob/read
          with: { resource: archive, key: repriced }
    Slow:
      steps:
        - uses: sleep
providers:
  Catalog:
    Lookup:
      steps:
        - uses: expr
          with: { value: '{sku: input.sku, price: 12}' }
";

fn pricing() -> NativeModule {
    NativeModule::builder("pricing")
        .import("Catalog", "Lookup")
        .export_value("Pricing", "Quote", |imports, input: Value| async move {
            let item = imports.call("Catalog", "Lookup", &input).await?;
            let price = item.get("price").and_then(Value::as_i64).unwrap_or_default();
            let qty = input.get("qty").and_then(Value::as_i64).unwrap_or(1);
            Ok(Value::from(json!({"sku": item.get("sku").cloned().unwrap_or_default(), "total": price * qty})))
        })
        .export("Pricing", "Ping", |_, _| async move { Ok(Payload::default()) })
        .import("Inventory", "Export")
        .import("Inventory", "Archive")
        .export_value("Pricing", "Reprice", |imports, _| async move {
            let repriced = imports
                .request_stream("Inventory", "Export", Payload::default())?
                .map(|item| -> Result<Payload, MeshError> {
                    let line = item?.to_value()?;
                    let n = line.get("n").and_then(Value::as_i64).unwrap_or_default();
                    Payload::from_value(&Value::from(json!({"n": n, "total": n * 12})))
                })
                .boxed();
            let written: Vec<Payload> = imports
                .request_channel("Inventory", "Archive", Payload::default(), repriced)?
                .try_collect()
                .await?;
            Ok(Value::from(i64::try_from(written.len()).unwrap_or_default()))
        })
        .build()
}

fn engine() -> Arc<Engine> {
    let mut components = Components::with_defaults().unwrap();
    components
        .registry
        .register(NamedLoader::new("sleep", |_, _| {
            Ok(Arc::new(FnAction::new(|_ctx, data: Data| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok((data, Flow::next()))
            })))
        }))
        .unwrap();
    let config = BusConfig::from_yaml(BUS).unwrap();
    Engine::load(&config, components.with_module(Arc::new(pricing()))).unwrap()
}

async fn call(engine: &Arc<Engine>, invocation: Invocation) -> Result<Value, BusError> {
    build_invocation_service(Arc::clone(engine), &EngineConfig::default())
        .oneshot(invocation)
        .await
}

fn invocation(ctx: RequestContext, handler: &str, input: serde_json::Value) -> Invocation {
    Invocation::new(ctx, handler.parse().unwrap(), Value::from(input))
}

#[tokio::test]
async fn operation_without_pipeline_or_module_is_unimplemented() {
    let engine = engine();
    let err = call(&engine, invocation(RequestContext::new("t"), "Greeter::SayHello", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unimplemented);
    assert_eq!(err.status, 501);
    assert_eq!(err.message, "Greeter::SayHello is not implemented");
}

#[tokio::test]
async fn unserved_operation_falls_through_to_module_and_back() {
    let engine = engine();
    let out = call(
        &engine,
        invocation(RequestContext::new("t"), "Pricing::Quote", json!({"sku": "A-1", "qty": 3})),
    )
    .await;
    assert_eq!(out, Ok(Value::from(json!({"sku": "A-1", "total": 36}))));

    let out = call(&engine, invocation(RequestContext::new("t"), "Pricing::Ping", json!({}))).await;
    assert_eq!(out, Ok(Value::Null));
}

#[tokio::test]
async fn input_is_coalesced_against_the_schema() {
    let engine = engine();
    let out = call(
        &engine,
        invocation(RequestContext::new("t"), "Inventory::Count", json!({"sku": "A-1", "min": "5"})),
    )
    .await;
    assert_eq!(out, Ok(Value::from(json!({"sku": "A-1", "min": 5}))));

    let err = call(&engine, invocation(RequestContext::new("t"), "Inventory::Count", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert!(err.message.contains("sku"), "{}", err.message);
}

#[tokio::test]
async fn records_stream_through_the_request_sink_in_order() {
    let engine = engine();
    let lines = json!([{"n": 1}, {"n": 2}, {"n": 3}, {"n": 4}]);
    call(&engine, invocation(RequestContext::new("t"), "Inventory::Import", json!({"lines": lines.clone()})))
        .await
        .unwrap();

    let (sink, source) = channel(2);
    let ctx = RequestContext::new("t").with_sink(Arc::new(sink));
    let reader = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { call(&engine, invocation(ctx, "Inventory::Export", json!({}))).await }
    });

    let mut seen = Vec::new();
    while let Some(record) = source.next().await.unwrap() {
        seen.push(record.value);
    }
    reader.await.unwrap().unwrap();

    assert_eq!(Value::from(seen), Value::from(lines));
    assert_eq!(source.next().await.unwrap(), None);
}

#[tokio::test]
async fn modules_stream_records_through_local_pipelines() {
    let engine = engine();
    let lines = json!([{"n": 1}, {"n": 2}, {"n": 3}]);
    call(&engine, invocation(RequestContext::new("t"), "Inventory::Import", json!({"lines": lines})))
        .await
        .unwrap();

    // Export streams out of blob/read; Archive drains the channel into blob/write.
    let out = call(&engine, invocation(RequestContext::new("t"), "Pricing::Reprice", json!({}))).await;
    assert_eq!(out, Ok(Value::from(0)));

    let archived = call(&engine, invocation(RequestContext::new("t"), "Inventory::Archived", json!({}))).await;
    assert_eq!(
        archived,
        Ok(Value::from(json!([
            {"n": 1, "total": 12},
            {"n": 2, "total": 24},
            {"n": 3, "total": 36}
        ])))
    );
}

#[tokio::test(start_paused = true)]
async fn invocation_deadline_overrides_the_default() {
    let engine = engine();
    let slow = invocation(RequestContext::new("t"), "Inventory::Slow", json!({}))
        .with_timeout(Duration::from_millis(100));
    let err = call(&engine, slow).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DeadlineExceeded);
    assert_eq!(err.status, 504);
}

#[tokio::test]
async fn close_shuts_down_the_mesh() {
    let engine = engine();
    engine.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), engine.mesh().wait_until_shutdown())
        .await
        .unwrap();
}
