//! Backoff schedules for the retry policy.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::{BackoffPolicy, RetryConfig};

/// Iterator-like backoff state for one step call.
///
/// Created fresh for every call so attempts and elapsed time never leak
/// between requests.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    retries: i64,
    current: Duration,
    started: Instant,
}

impl Backoff {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            retries: 0,
            current: config.initial_interval,
            started: Instant::now(),
        }
    }

    /// Delay before the next attempt, or `None` when the policy is
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_retries >= 0 && self.retries >= self.config.max_retries {
            return None;
        }
        let delay = match self.config.policy {
            BackoffPolicy::Constant => self.config.duration,
            BackoffPolicy::Exponential => {
                let delay = randomize(self.current, self.config.randomization_factor);
                self.current = self
                    .current
                    .mul_f64(self.config.multiplier.max(1.0))
                    .min(self.config.max_interval);
                delay
            }
        };
        let limit = self.config.max_elapsed_time;
        if !limit.is_zero() && self.started.elapsed() + delay > limit {
            return None;
        }
        self.retries += 1;
        Some(delay)
    }

    /// Number of delays handed out so far.
    #[must_use]
    pub fn retries(&self) -> i64 {
        self.retries
    }
}

/// Picks a value uniformly from `interval * (1 ± factor)`.
fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let secs = interval.as_secs_f64();
    let delta = secs * factor.min(1.0);
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range((secs - delta)..=(secs + delta)))
}
