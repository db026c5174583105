use std::time::Duration;

/// Runtime knobs of the invocation stack and transports.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied to invocations that do not carry their own.
    pub default_timeout: Duration,
    /// Concurrent invocations admitted before load shedding.
    pub max_concurrent_invocations: u32,
    /// Capacity of record channels opened for streaming responses.
    pub stream_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_concurrent_invocations: 1000,
            stream_buffer: 100,
        }
    }
}
