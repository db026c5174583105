//! End-to-end pipeline behaviour: bus YAML loaded into an engine and
//! invoked through the tower service stack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relaybus_core::{ActionError, Data, ErrorCode, FnAction, Flow, RequestContext, Value};
use relaybus_server::registry::NamedLoader;
use relaybus_server::{build_invocation_service, BusConfig, Components, Engine, EngineConfig, Invocation};
use serde_json::json;
use tower::ServiceExt;

const BUS: &str = r"
id: pipelines
resiliency:
  retries:
    quick:
      policy: constant
      duration: 10ms
      maxRetries: 3
  circuitBreakers:
    fragile:
      timeout: 30s
      trip: 'consecutiveFailures >= 2'
interfaces:
  Greeter:
    Greet:
      steps:
        - uses: filter
          with: { condition: 'input.enabled == true' }
        - uses: expr
          with: { value: input.name, to: greeting }
        - uses: expr
          with: { value: greeting }
    Twice:
      steps:
        - name: bind
          uses: expr
          with: { value: 'input.n + 1' }
          returns: x
        - uses: expr
          with: { value: '{x: x, doubled: x * 2}' }
  Router:
    Single:
      steps:
        - uses: route
          with:
            selection: single
            routes:
              - name: small
                when: 'input.n < 10'
                then:
                  - uses: expr
                    with: { value: '''small''' }
              - name: even
                when: 'input.n % 2 == 0'
                then:
                  - uses: expr
                    with: { value: '''even''' }
              - name: other
                then:
                  - uses: expr
                    with: { value: '''other''' }
    Multi:
      steps:
        - uses: expr
          with: { value: '[]' }
          returns: seen
        - uses: route
          with:
            selection: multi
            routes:
              - name: small
                when: 'input.n < 10'
                then:
                  - uses: expr
                    with: { value: 'seen + [''small'']', to: seen }
              - name: even
                when: 'input.n % 2 == 0'
                then:
                  - uses: expr
                    with: { value: 'seen + [''even'']', to: seen }
              - name: large
                when: 'input.n >= 10'
                then:
                  - uses: expr
                    with: { value: 'seen + [''large'']', to: seen }
  Orders:
    Place:
      steps:
        - name: charge
          uses: decline
          onError:
            steps:
              - uses: expr
                with: { value: '{recovered: true, step: $error.step, message: $error.message}' }
    Flaky:
      steps:
        - uses: flaky
          retry: quick
    Guarded:
      steps:
        - uses: decline
          circuitBreaker: fragile
    Nested:
      steps:
        - uses: call_pipeline
          with: { pipeline: checked }
        - uses: expr
          with: { value: '''after '' + string($)' }
pipelines:
  checked:
    steps:
      - uses: expr
        with: { value: '1' }
      - uses: filter
        with: { condition: 'false' }
";

struct Harness {
    engine: Arc<Engine>,
    flaky_calls: Arc<AtomicUsize>,
    declines: Arc<AtomicUsize>,
}

fn harness() -> Harness {
    let flaky_calls = Arc::new(AtomicUsize::new(0));
    let declines = Arc::new(AtomicUsize::new(0));
    let mut components = Components::with_defaults().unwrap();

    let calls = Arc::clone(&flaky_calls);
    components
        .registry
        .register(NamedLoader::new("flaky", move |_, _| {
            let calls = Arc::clone(&calls);
            Ok(Arc::new(FnAction::new(move |_ctx, data: Data| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        return Err(ActionError::with_code(ErrorCode::Unavailable, "warming up").retriable());
                    }
                    Ok((data, Flow::value(Value::from(i64::try_from(attempt).unwrap()))))
                }
            })))
        }))
        .unwrap();

    let count = Arc::clone(&declines);
    components
        .registry
        .register(NamedLoader::new("decline", move |_, _| {
            let count = Arc::clone(&count);
            Ok(Arc::new(FnAction::new(move |_ctx, _data: Data| {
                count.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(Data, Flow), _>(ActionError::new("card declined")) }
            })))
        }))
        .unwrap();

    let config = BusConfig::from_yaml(BUS).unwrap();
    Harness {
        engine: Engine::load(&config, components).unwrap(),
        flaky_calls,
        declines,
    }
}

async fn call(engine: &Arc<Engine>, handler: &str, input: serde_json::Value) -> Result<Value, relaybus_core::BusError> {
    let service = build_invocation_service(Arc::clone(engine), &EngineConfig::default());
    service
        .oneshot(Invocation::new(
            RequestContext::new("it"),
            handler.parse().unwrap(),
            Value::from(input),
        ))
        .await
}

#[tokio::test]
async fn filter_guards_the_rest_of_the_pipeline() {
    let h = harness();
    let out = call(&h.engine, "Greeter::Greet", json!({"enabled": true, "name": "Ada"})).await;
    assert_eq!(out, Ok(Value::from("Ada")));

    let out = call(&h.engine, "Greeter::Greet", json!({"enabled": false})).await;
    assert_eq!(out, Ok(Value::Null));
}

#[tokio::test]
async fn later_steps_observe_bound_results() {
    let h = harness();
    let out = call(&h.engine, "Greeter::Twice", json!({"n": 4})).await.unwrap();
    assert_eq!(out, Value::from(json!({"x": 5, "doubled": 10})));
}

#[tokio::test]
async fn single_route_runs_one_branch() {
    let h = harness();
    let cases = [(4, "small"), (12, "even"), (13, "other")];
    for (n, expected) in cases {
        let out = call(&h.engine, "Router::Single", json!({"n": n})).await;
        assert_eq!(out, Ok(Value::from(expected)), "n = {n}");
    }
}

#[tokio::test]
async fn multi_route_runs_every_match_in_order() {
    let h = harness();
    let out = call(&h.engine, "Router::Multi", json!({"n": 4})).await;
    assert_eq!(out, Ok(Value::from(json!(["small", "even"]))));

    let out = call(&h.engine, "Router::Multi", json!({"n": 11})).await;
    assert_eq!(out, Ok(Value::from(json!(["large"]))));
}

#[tokio::test]
async fn recovery_pipeline_replaces_the_failure() {
    let h = harness();
    let out = call(&h.engine, "Orders::Place", json!({})).await.unwrap();
    assert_eq!(
        out,
        Value::from(json!({"recovered": true, "step": "charge", "message": "card declined"}))
    );
}

#[tokio::test(start_paused = true)]
async fn retriable_failures_are_retried() {
    let h = harness();
    let out = call(&h.engine, "Orders::Flaky", json!({})).await;
    assert_eq!(out, Ok(Value::from(3)));
    assert_eq!(h.flaky_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn open_breaker_fails_fast() {
    let h = harness();
    for _ in 0..2 {
        let err = call(&h.engine, "Orders::Guarded", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "card declined");
    }

    let err = call(&h.engine, "Orders::Guarded", json!({})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Unavailable);
    assert_eq!(err.status, 503);
    assert_eq!(h.declines.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stop_inside_called_pipeline_is_absorbed() {
    let h = harness();
    let out = call(&h.engine, "Orders::Nested", json!({})).await;
    assert_eq!(out, Ok(Value::from("after 1")));
}
