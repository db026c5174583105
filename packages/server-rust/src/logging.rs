//! Subscriber bootstrap and the injectable logger capability.

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Capability name of the [`Logger`].
pub const LOGGER: &str = "system:logger";

/// Initialize structured logging with tracing-subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to the provided
/// level. `json` switches to one JSON object per line.
pub fn init(log_level: &str, json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Logger handed to actions through the resolver. Events emitted through it
/// are recorded as children of the bus span, so they carry the bus id.
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
}

impl Logger {
    #[must_use]
    pub fn new(bus_id: &str) -> Self {
        Self {
            span: tracing::info_span!("bus", id = %bus_id),
        }
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("relaybus")
    }
}
