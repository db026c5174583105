//! relaybus runtime: loads a bus configuration into an [`engine::Engine`]
//! that runs declarative pipelines, dispatches unserved operations to
//! compute modules through the [`mesh::Mesh`], and serves invocations over
//! HTTP.

pub mod actions;
pub mod config;
pub mod engine;
pub mod handle;
pub mod logging;
pub mod mesh;
pub mod processor;
pub mod registry;
pub mod resiliency;
pub mod resource;
pub mod service;
pub mod template;
pub mod transport;

pub use config::BusConfig;
pub use engine::{Components, Engine, EngineError};
pub use service::{build_invocation_service, EngineConfig, Invocation};
pub use transport::{HttpConfig, HttpTransport};
