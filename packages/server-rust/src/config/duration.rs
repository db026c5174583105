//! Human-friendly durations: `"250ms"`, `"5s"`, `"1m30s"`, `"2h"`, or a bare
//! integer number of milliseconds.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use super::ConfigError;

/// Parses a duration string.
///
/// # Errors
///
/// Returns [`ConfigError::Duration`] for empty input, unknown units or
/// malformed numbers.
pub fn parse(input: &str) -> Result<Duration, ConfigError> {
    let text = input.trim();
    let bad = |reason: &str| ConfigError::Duration {
        input: input.to_string(),
        reason: reason.to_string(),
    };
    if text.is_empty() {
        return Err(bad("empty"));
    }
    if let Ok(millis) = text.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| bad("missing unit"))?;
        if digits == 0 {
            return Err(bad("expected a number"));
        }
        let number = &rest[..digits];
        let unit_len = rest[digits..]
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len() - digits);
        let unit = &rest[digits..digits + unit_len];
        let nanos_per_unit: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(bad("unknown unit")),
        };
        let part = if let Ok(whole) = number.parse::<u64>() {
            whole
                .checked_mul(nanos_per_unit)
                .map(Duration::from_nanos)
                .ok_or_else(|| bad("out of range"))?
        } else {
            let amount: f64 = number.parse().map_err(|_| bad("invalid number"))?;
            #[allow(clippy::cast_precision_loss)]
            let seconds = amount * nanos_per_unit as f64 / 1e9;
            Duration::try_from_secs_f64(seconds).map_err(|_| bad("out of range"))?
        };
        total = total.checked_add(part).ok_or_else(|| bad("out of range"))?;
        rest = &rest[digits + unit_len..];
    }
    Ok(total)
}

struct DurationVisitor;

impl Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration such as \"500ms\", \"5s\" or a number of milliseconds")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_millis(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_millis)
            .map_err(|_| E::custom("duration must not be negative"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
        parse(v).map_err(E::custom)
    }
}

/// `deserialize_with` helper for `Duration` fields.
///
/// # Errors
///
/// Returns a deserialization error for malformed durations.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    deserializer.deserialize_any(DurationVisitor)
}

/// A `Duration` that deserializes from the human-friendly forms, for use
/// as a map value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize(deserializer).map(Self)
    }
}

impl From<HumanDuration> for Duration {
    fn from(d: HumanDuration) -> Self {
        d.0
    }
}
