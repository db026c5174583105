//! The invocation service stack transports call into.
//!
//! An [`Invocation`] passes load shedding, the deadline and metrics layers
//! (`middleware`) before reaching the [`EngineService`], which hands it to
//! the engine.

pub mod config;
pub mod dispatch;
pub mod invocation;
pub mod middleware;

pub use config::EngineConfig;
pub use dispatch::EngineService;
pub use invocation::Invocation;
pub use middleware::{build_invocation_service, InvocationService};
