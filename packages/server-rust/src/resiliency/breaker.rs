//! Circuit breaker shared by every step that references the same policy.
//!
//! Closed counts outcomes and trips to Open when the configured trip
//! expression holds. Open rejects calls until `timeout` elapses, then moves
//! to HalfOpen, which admits up to `max_requests` probes: that many
//! consecutive successes close the breaker, any failure reopens it. A call
//! that is dropped before it finishes counts as a failure. Every state
//! change starts a new generation, and outcomes reported for an older
//! generation are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use parking_lot::Mutex;
use relaybus_core::{ActionError, ErrorCode, Value};
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        })
    }
}

/// Outcome counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Scope for the trip expression.
    fn to_scope(self) -> BTreeMap<String, Value> {
        [
            ("requests", self.requests),
            ("totalSuccesses", self.total_successes),
            ("totalFailures", self.total_failures),
            ("consecutiveSuccesses", self.consecutive_successes),
            ("consecutiveFailures", self.consecutive_failures),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::from(v)))
        .collect()
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let expiry = (!config.interval.is_zero()).then(|| Instant::now() + config.interval);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> State {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    #[must_use]
    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// Runs `call` if the breaker admits it and records the outcome.
    ///
    /// # Errors
    ///
    /// Returns a permanent `unavailable` error without running `call` when
    /// the breaker is open or the half-open probe quota is used up;
    /// otherwise returns `call`'s own result.
    pub async fn execute<T, F>(&self, call: F) -> Result<T, ActionError>
    where
        F: Future<Output = Result<T, ActionError>>,
    {
        let permit = Permit {
            breaker: self,
            generation: self.before_call()?,
            settled: false,
        };
        let result = call.await;
        permit.settle(result.is_ok());
        result
    }

    fn before_call(&self) -> Result<u64, ActionError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        match inner.state {
            State::Open => {
                return Err(self.rejection("is open"));
            }
            State::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                return Err(self.rejection("has too many half-open requests"));
            }
            _ => {}
        }
        inner.counts.on_request();
        Ok(inner.generation)
    }

    fn after_call(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }
        match (inner.state, success) {
            (State::Closed, true) => inner.counts.on_success(),
            (State::HalfOpen, true) => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.max_requests {
                    self.transition(&mut inner, State::Closed, now);
                }
            }
            (State::Closed, false) => {
                inner.counts.on_failure();
                if self.should_trip(inner.counts) {
                    self.transition(&mut inner, State::Open, now);
                }
            }
            (State::HalfOpen, false) => self.transition(&mut inner, State::Open, now),
            (State::Open, _) => {}
        }
    }

    fn should_trip(&self, counts: Counts) -> bool {
        match self.config.trip.eval_bool(&counts.to_scope()) {
            Ok(trip) => trip,
            Err(error) => {
                tracing::warn!(breaker = %self.name, %error, "trip condition failed to evaluate");
                false
            }
        }
    }

    /// Applies time-based transitions: cyclic count reset while closed and
    /// the open-to-half-open move once the cooldown expires.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            State::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            State::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.transition(inner, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: State, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);
        tracing::info!(breaker = %self.name, %from, %to, "circuit breaker state changed");
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            State::Closed => (!self.config.interval.is_zero()).then(|| now + self.config.interval),
            State::Open => Some(now + self.config.timeout),
            State::HalfOpen => None,
        };
    }

    fn rejection(&self, reason: &str) -> ActionError {
        ActionError::with_code(
            ErrorCode::Unavailable,
            format!("circuit breaker {:?} {reason}", self.name),
        )
        .permanent()
    }
}

/// An admitted call. Dropping it unsettled (the caller's future was
/// cancelled) reports a failure so a half-open slot is never leaked.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.after_call(self.generation, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(breaker = %self.breaker.name, "call dropped before completion");
            self.breaker.after_call(self.generation, false);
        }
    }
}
