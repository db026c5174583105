//! Tower middleware layers for the invocation stack.
//!
//! - [`load_shed`]: semaphore-based concurrency limiting
//! - [`timeout`]: per-invocation deadlines
//! - [`metrics`]: timing, outcome span fields and `metrics` counters
//! - [`pipeline`]: composes all layers around the engine

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_invocation_service, InvocationService};
pub use timeout::TimeoutLayer;
