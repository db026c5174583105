//! Stack composition: combines the middleware layers with the engine.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::engine::Engine;
use crate::service::config::EngineConfig;
use crate::service::dispatch::EngineService;

/// The composed invocation stack. `Clone` and shareable across tasks; every
/// clone shares the same concurrency limit.
pub type InvocationService = LoadShedService<TimeoutService<MetricsService<EngineService>>>;

/// Builds the invocation stack around `engine`.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded before doing any work
/// 2. `TimeoutLayer` -- enforce the invocation deadline
/// 3. `MetricsLayer` -- record timing and outcome closest to the engine
#[must_use]
pub fn build_invocation_service(engine: Arc<Engine>, config: &EngineConfig) -> InvocationService {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_invocations))
        .layer(TimeoutLayer::new(config.default_timeout))
        .layer(MetricsLayer)
        .service(EngineService::new(engine))
}
