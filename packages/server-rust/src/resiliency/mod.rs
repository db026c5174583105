//! Named timeout, retry and circuit-breaker policies and the decorator that
//! applies them around a step's action.

pub mod breaker;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaybus_core::{Action, ActionError, Data, ErrorCode, Flow, RequestContext};

pub use breaker::{CircuitBreaker, Counts, State};
pub use retry::Backoff;

use crate::config::{duration, ResiliencyConfig, RetryConfig, StepConfig};
use crate::registry::LoadError;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Policies declared under `resiliency:`. Circuit breakers are created once
/// here, so every step naming the same breaker shares its state.
#[derive(Debug, Default)]
pub struct Policies {
    timeouts: HashMap<String, Duration>,
    retries: HashMap<String, RetryConfig>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl Policies {
    #[must_use]
    pub fn from_config(config: &ResiliencyConfig) -> Self {
        Self {
            timeouts: config
                .timeouts
                .iter()
                .map(|(name, d)| (name.clone(), d.0))
                .collect(),
            retries: config.retries.clone().into_iter().collect(),
            breakers: config
                .circuit_breakers
                .iter()
                .map(|(name, cb)| (name.clone(), Arc::new(CircuitBreaker::new(name, cb.clone()))))
                .collect(),
        }
    }

    /// A named timeout policy, or `reference` parsed as a literal duration.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownPolicy`] when it is neither.
    pub fn timeout(&self, reference: &str) -> Result<Duration, LoadError> {
        if let Some(d) = self.timeouts.get(reference) {
            return Ok(*d);
        }
        duration::parse(reference).map_err(|_| LoadError::UnknownPolicy {
            kind: "timeout",
            name: reference.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`LoadError::UnknownPolicy`] for undeclared names.
    pub fn retry(&self, name: &str) -> Result<&RetryConfig, LoadError> {
        self.retries.get(name).ok_or_else(|| LoadError::UnknownPolicy {
            kind: "retry",
            name: name.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`LoadError::UnknownPolicy`] for undeclared names.
    pub fn circuit_breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>, LoadError> {
        self.breakers
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::UnknownPolicy {
                kind: "circuit breaker",
                name: name.to_string(),
            })
    }

    /// Wraps `action` in the policies the step references. Returns the
    /// action unchanged when it references none.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownPolicy`] for any undeclared reference.
    pub fn wrap(&self, action: Arc<dyn Action>, step: &StepConfig) -> Result<Arc<dyn Action>, LoadError> {
        let timeout = step.timeout.as_deref().map(|t| self.timeout(t)).transpose()?;
        let retry = step.retry.as_deref().map(|r| self.retry(r).cloned()).transpose()?;
        let breaker = step
            .circuit_breaker
            .as_deref()
            .map(|cb| self.circuit_breaker(cb))
            .transpose()?;
        if timeout.is_none() && retry.is_none() && breaker.is_none() {
            return Ok(action);
        }
        Ok(Arc::new(Resilient {
            inner: action,
            timeout,
            retry,
            breaker,
        }))
    }
}

// ---------------------------------------------------------------------------
// Resilient
// ---------------------------------------------------------------------------

/// Action decorator. Nesting from the outside in: retry, circuit breaker,
/// timeout, then the wrapped action.
pub struct Resilient {
    inner: Arc<dyn Action>,
    timeout: Option<Duration>,
    retry: Option<RetryConfig>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Resilient {
    async fn attempt(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let call = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, self.inner.call(ctx, data))
                    .await
                    .unwrap_or_else(|_| Err(timed_out(limit))),
                None => self.inner.call(ctx, data).await,
            }
        };
        match &self.breaker {
            Some(breaker) => breaker.execute(call).await,
            None => call.await,
        }
    }
}

#[async_trait]
impl Action for Resilient {
    async fn call(&self, ctx: &RequestContext, data: &mut Data) -> Result<Flow, ActionError> {
        let mut backoff = self.retry.as_ref().map(Backoff::new);
        loop {
            match self.attempt(ctx, data).await {
                Err(error) if error.is_retriable() => {
                    let Some(delay) = backoff.as_mut().and_then(Backoff::next_delay) else {
                        return Err(error);
                    };
                    tracing::debug!(
                        %error,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying step"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn timed_out(limit: Duration) -> ActionError {
    ActionError::with_code(
        ErrorCode::DeadlineExceeded,
        format!("step timed out after {}ms", limit.as_millis()),
    )
    .retriable()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use relaybus_core::{Expr, Value};

    use super::*;
    use crate::config::{BackoffPolicy, CircuitBreakerConfig, HumanDuration};

    /// Fails `failures` times with the given error, then succeeds.
    struct Flaky {
        failures: u32,
        error: ActionError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: ActionError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Action for Flaky {
        async fn call(&self, _ctx: &RequestContext, _data: &mut Data) -> Result<Flow, ActionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(Flow::value("done"))
            }
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl Action for Sleepy {
        async fn call(&self, _ctx: &RequestContext, _data: &mut Data) -> Result<Flow, ActionError> {
            tokio::time::sleep(self.0).await;
            Ok(Flow::next())
        }
    }

    fn policies() -> Policies {
        let mut config = ResiliencyConfig::default();
        config
            .timeouts
            .insert("short".into(), HumanDuration(Duration::from_millis(50)));
        config.retries.insert(
            "fast".into(),
            RetryConfig {
                policy: BackoffPolicy::Constant,
                duration: Duration::from_millis(10),
                max_retries: 3,
                ..RetryConfig::default()
            },
        );
        config.circuit_breakers.insert(
            "cb".into(),
            CircuitBreakerConfig {
                trip: Expr::compile("consecutiveFailures >= 2").unwrap(),
                ..CircuitBreakerConfig::default()
            },
        );
        Policies::from_config(&config)
    }

    fn step(timeout: Option<&str>, retry: Option<&str>, cb: Option<&str>) -> StepConfig {
        StepConfig {
            name: None,
            uses: "test".into(),
            with: Value::Null,
            returns: None,
            timeout: timeout.map(Into::into),
            retry: retry.map(Into::into),
            circuit_breaker: cb.map(Into::into),
            on_error: None,
        }
    }

    async fn run(action: &Arc<dyn Action>) -> Result<Flow, ActionError> {
        action.call(&RequestContext::default(), &mut Data::new()).await
    }

    #[tokio::test(start_paused = true)]
    async fn retries_only_retriable_errors() {
        let policies = policies();

        let flaky = Flaky::new(2, ActionError::new("blip").retriable());
        let wrapped = policies.wrap(flaky.clone(), &step(None, Some("fast"), None)).unwrap();
        assert_eq!(run(&wrapped).await.unwrap(), Flow::value("done"));
        assert_eq!(flaky.calls(), 3);

        let unmarked = Flaky::new(1, ActionError::new("write failed"));
        let wrapped = policies.wrap(unmarked.clone(), &step(None, Some("fast"), None)).unwrap();
        assert!(run(&wrapped).await.is_err());
        assert_eq!(unmarked.calls(), 1);

        let permanent = Flaky::new(1, ActionError::new("bad input").permanent());
        let wrapped = policies.wrap(permanent.clone(), &step(None, Some("fast"), None)).unwrap();
        assert!(run(&wrapped).await.is_err());
        assert_eq!(permanent.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_retries() {
        let flaky = Flaky::new(10, ActionError::new("blip").retriable());
        let wrapped = policies().wrap(flaky.clone(), &step(None, Some("fast"), None)).unwrap();
        assert!(run(&wrapped).await.is_err());
        assert_eq!(flaky.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_retriable_deadline_exceeded() {
        let sleepy: Arc<dyn Action> = Arc::new(Sleepy(Duration::from_secs(5)));
        let wrapped = policies().wrap(sleepy, &step(Some("short"), None, None)).unwrap();
        let err = run(&wrapped).await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::DeadlineExceeded));
        assert!(err.is_retriable());

        let literal = policies()
            .wrap(Arc::new(Sleepy(Duration::from_millis(5))), &step(Some("1s"), None, None))
            .unwrap();
        assert!(run(&literal).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_retry() {
        let policies = policies();
        let flaky = Flaky::new(10, ActionError::new("down").retriable());
        let wrapped = policies
            .wrap(flaky.clone(), &step(None, Some("fast"), Some("cb")))
            .unwrap();
        let err = run(&wrapped).await.unwrap_err();
        // Two failures trip the breaker; the third attempt is rejected as permanent.
        assert_eq!(flaky.calls(), 2);
        assert_eq!(err.code, Some(ErrorCode::Unavailable));
        assert_eq!(policies.circuit_breaker("cb").unwrap().state(), State::Open);
    }

    #[test]
    fn unknown_policies_fail_to_load() {
        let policies = policies();
        let action: Arc<dyn Action> = Arc::new(Sleepy(Duration::ZERO));
        for s in [
            step(Some("forever-ish"), None, None),
            step(None, Some("nope"), None),
            step(None, None, Some("nope")),
        ] {
            assert!(matches!(
                policies.wrap(action.clone(), &s),
                Err(LoadError::UnknownPolicy { .. })
            ));
        }
    }
}
