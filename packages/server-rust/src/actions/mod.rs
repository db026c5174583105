//! Built-in actions, installed into a [`Registry`] by name.
//!
//! Control flow: `filter`, `route`, `call_pipeline`, `call_provider`,
//! `call_interface`, `invoke`. Values: `expr`, `assign`, `log`, `decode`.
//! I/O: `http`, `blob/read`, `blob/write`.

pub mod blob;
pub mod call;
pub mod decode;
pub mod expr;
pub mod filter;
pub mod http;
pub mod log;
pub mod route;

use crate::registry::{NamedLoader, Registry, RegistryError};

/// Every built-in loader.
#[must_use]
pub fn all() -> Vec<NamedLoader> {
    vec![
        filter::loader(),
        route::loader(),
        expr::loader(),
        expr::assign_loader(),
        log::loader(),
        call::pipeline_loader(),
        call::provider_loader(),
        call::interface_loader(),
        call::invoke_loader(),
        decode::loader(),
        http::loader(),
        blob::read_loader(),
        blob::write_loader(),
    ]
}

/// Installs every built-in into `registry`.
///
/// # Errors
///
/// Returns [`RegistryError`] if a built-in name is already taken.
pub fn register_all(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_all(all())
}
