//! Inbound transports. The HTTP RPC transport maps `POST
//! /{interface}/{operation}` onto the invocation stack.

pub mod config;
pub mod filter;
pub mod httprpc;
pub mod middleware;
pub mod shutdown;

pub use config::HttpConfig;
pub use filter::{Filter, Filters, FILTERS};
pub use httprpc::HttpTransport;
pub use shutdown::{HealthState, ShutdownController};
