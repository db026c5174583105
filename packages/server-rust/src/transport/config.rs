use std::time::Duration;

use crate::service::EngineConfig;

/// HTTP RPC transport settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// `host:port` to bind; port `0` picks an ephemeral port.
    pub address: String,
    /// Transport-level ceiling on a whole request, above the invocation
    /// deadline.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight requests.
    pub drain_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            engine: EngineConfig::default(),
        }
    }
}
