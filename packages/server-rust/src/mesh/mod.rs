//! The compute mesh: a bidirectional router between compute modules and the
//! locally configured operations.
//!
//! Every linked [`Module`] declares the operations it exports (serves) and
//! imports (calls). Exports are published under their `{namespace,
//! operation}` address; imports are wired to the export with the same
//! address as soon as one is linked. Local pipelines are linked the same way
//! through [`PipelineModule`], so compute modules reach configured
//! operations with the same addressing the engine uses to reach them.
//!
//! Lookups are lock-free: the address table and each export cell live in
//! `ArcSwap`s. Linking is serialised by a mutex.

pub mod compute;
pub mod module;
pub mod native;
pub mod pipeline_module;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relaybus_core::{ActionError, ErrorCode, RequestContext};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use compute::{ComputeLoaders, RpcModule};
pub use module::{Destination, Direction, Link, Module, Operation, OperationKind, Payload, PayloadStream};
pub use native::{Imports, NativeModule, NativeModuleBuilder};
pub use pipeline_module::PipelineModule;

/// Capability name of the [`Mesh`].
pub const MESH: &str = "compute:mesh";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeshError {
    #[error("{address} is not exported by any linked module")]
    NotExported { address: Address },
    #[error("unsatisfied imports: {}", join(.0))]
    Unsatisfied(Vec<Address>),
    #[error("{address} does not support {kind}")]
    Unsupported { address: Address, kind: OperationKind },
    #[error("no operation at index {index}")]
    UnknownIndex { index: u32 },
    #[error("payload: {0}")]
    Payload(String),
    #[error("{0}")]
    Module(String),
    /// A step or handler failure, kept intact so its code, template and
    /// metadata reach the caller unchanged.
    #[error(transparent)]
    Failed(#[from] ActionError),
    #[error("failed to close modules: {}", .0.join("; "))]
    Close(Vec<String>),
}

fn join(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<MeshError> for ActionError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::Failed(err) => err,
            MeshError::NotExported { .. } | MeshError::Unsupported { .. } => {
                ActionError::with_code(ErrorCode::Unimplemented, err.to_string()).permanent()
            }
            MeshError::Payload(_) => {
                ActionError::with_code(ErrorCode::InvalidArgument, err.to_string()).permanent()
            }
            _ => ActionError::with_code(ErrorCode::Internal, err.to_string()),
        }
    }
}

/// `{namespace, operation}` key of an export or import.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub namespace: String,
    pub operation: String,
}

impl Address {
    #[must_use]
    pub fn new(namespace: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.operation)
    }
}

impl From<&relaybus_core::Handler> for Address {
    fn from(handler: &relaybus_core::Handler) -> Self {
        Self::new(&handler.interface, &handler.operation)
    }
}

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

struct Pending {
    module: Arc<dyn Module>,
    operation: Operation,
}

#[derive(Default)]
struct LinkState {
    modules: Vec<Arc<dyn Module>>,
    unsatisfied: Vec<Pending>,
}

pub struct Mesh {
    exports: ArcSwap<HashMap<Address, Link>>,
    state: Mutex<LinkState>,
    done: CancellationToken,
}

impl Mesh {
    #[must_use]
    pub fn new() -> Self {
        Self {
            exports: ArcSwap::from_pointee(HashMap::new()),
            state: Mutex::new(LinkState::default()),
            done: CancellationToken::new(),
        }
    }

    /// Links `module`: publishes its exports (replacing any earlier export
    /// of the same address), wires its imports, then retries imports left
    /// unsatisfied by earlier links.
    pub fn link(&self, module: Arc<dyn Module>) {
        let mut state = self.state.lock();
        let operations = module.operations();

        let mut table = HashMap::clone(&self.exports.load());
        let mut exported = 0_usize;
        for op in operations.iter().filter(|op| op.direction == Direction::Export) {
            let destination = Destination::new(Arc::clone(&module), op);
            let address = op.address();
            match table.get(&address) {
                Some(link) => link.replace(destination),
                None => {
                    table.insert(address, Link::new(destination));
                }
            }
            exported += 1;
        }
        self.exports.store(Arc::new(table));

        for op in operations.into_iter().filter(|op| op.direction == Direction::Import) {
            if !self.link_import(module.as_ref(), &op) {
                state.unsatisfied.push(Pending {
                    module: Arc::clone(&module),
                    operation: op,
                });
            }
        }

        if exported > 0 && !state.unsatisfied.is_empty() {
            let pending = std::mem::take(&mut state.unsatisfied);
            state.unsatisfied = pending
                .into_iter()
                .filter(|p| !self.link_import(p.module.as_ref(), &p.operation))
                .collect();
        }

        tracing::debug!(
            module = module.name(),
            exported,
            unsatisfied = state.unsatisfied.len(),
            "module linked"
        );
        state.modules.push(module);
    }

    fn link_import(&self, module: &dyn Module, op: &Operation) -> bool {
        let Some(link) = self.exports.load().get(&op.address()).cloned() else {
            return false;
        };
        module.link_import(op.index, link);
        true
    }

    /// Imports that no linked module exports yet.
    #[must_use]
    pub fn unsatisfied(&self) -> Vec<Operation> {
        self.state
            .lock()
            .unsatisfied
            .iter()
            .map(|p| p.operation.clone())
            .collect()
    }

    /// Fails if any import is still unsatisfied, logging each missing
    /// address.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Unsatisfied`] listing every missing address.
    pub fn check(&self) -> Result<(), MeshError> {
        let missing: Vec<Address> = self.unsatisfied().iter().map(Operation::address).collect();
        if missing.is_empty() {
            return Ok(());
        }
        for address in &missing {
            tracing::error!(namespace = %address.namespace, operation = %address.operation, "missing import");
        }
        Err(MeshError::Unsatisfied(missing))
    }

    /// The export cell for `address`, if any module exports it.
    #[must_use]
    pub fn lookup(&self, address: &Address) -> Option<Link> {
        self.exports.load().get(address).cloned()
    }

    #[must_use]
    pub fn is_exported(&self, address: &Address) -> bool {
        self.exports.load().contains_key(address)
    }

    /// # Errors
    ///
    /// Returns [`MeshError::NotExported`] when nothing serves `address`, or
    /// the destination module's failure.
    pub async fn request_response(
        &self,
        ctx: &RequestContext,
        address: &Address,
        payload: Payload,
    ) -> Result<Payload, MeshError> {
        let link = self.require(address)?;
        let span = tracing::info_span!("mesh", request_id = %ctx.request_id, destination = %address);
        link.request_response(ctx, payload).instrument(span).await
    }

    /// # Errors
    ///
    /// Returns [`MeshError::NotExported`] when nothing serves `address`.
    pub async fn fire_and_forget(
        &self,
        ctx: &RequestContext,
        address: &Address,
        payload: Payload,
    ) -> Result<(), MeshError> {
        self.require(address)?.fire_and_forget(ctx, payload).await
    }

    /// # Errors
    ///
    /// Returns [`MeshError::NotExported`] when nothing serves `address`.
    pub fn request_stream(
        &self,
        ctx: &RequestContext,
        address: &Address,
        payload: Payload,
    ) -> Result<PayloadStream, MeshError> {
        Ok(self.require(address)?.request_stream(ctx, payload))
    }

    /// # Errors
    ///
    /// Returns [`MeshError::NotExported`] when nothing serves `address`.
    pub fn request_channel(
        &self,
        ctx: &RequestContext,
        address: &Address,
        payload: Payload,
        input: PayloadStream,
    ) -> Result<PayloadStream, MeshError> {
        Ok(self.require(address)?.request_channel(ctx, payload, input))
    }

    fn require(&self, address: &Address) -> Result<Link, MeshError> {
        self.lookup(address).ok_or_else(|| MeshError::NotExported {
            address: address.clone(),
        })
    }

    /// Closes every linked module, then releases
    /// [`wait_until_shutdown`](Self::wait_until_shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Close`] with every module's failure.
    pub async fn close(&self) -> Result<(), MeshError> {
        let modules = std::mem::take(&mut self.state.lock().modules);
        let mut failures = Vec::new();
        for module in modules {
            if let Err(e) = module.close().await {
                failures.push(format!("{}: {e}", module.name()));
            }
        }
        self.done.cancel();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Close(failures))
        }
    }

    /// Resolves once [`close`](Self::close) has run.
    pub async fn wait_until_shutdown(&self) {
        self.done.cancelled().await;
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut exports: Vec<String> = self.exports.load().keys().map(ToString::to_string).collect();
        exports.sort();
        f.debug_struct("Mesh").field("exports", &exports).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("mesh-test")
    }

    fn echo(name: &str, namespace: &str, prefix: &'static str) -> Arc<NativeModule> {
        Arc::new(
            NativeModule::builder(name)
                .export(namespace, "Echo", move |_imports, payload: Payload| async move {
                    let mut out = prefix.as_bytes().to_vec();
                    out.extend_from_slice(&payload.data);
                    Ok(Payload::new(out))
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn routes_to_exporter_and_stamps_index() {
        let mesh = Mesh::new();
        let module = Arc::new(
            NativeModule::builder("indexed")
                .export("A", "First", |_, _| async { Ok(Payload::new("first")) })
                .export("A", "Second", |_, payload: Payload| async move {
                    Ok(Payload::new(payload.index().to_be_bytes().to_vec()))
                })
                .build(),
        );
        mesh.link(module);

        let out = mesh
            .request_response(&ctx(), &Address::new("A", "Second"), Payload::new(Bytes::new()))
            .await
            .unwrap();
        assert_eq!(out.data.as_ref(), &1_u32.to_be_bytes());
    }

    #[tokio::test]
    async fn last_linked_export_wins() {
        let mesh = Mesh::new();
        mesh.link(echo("one", "Svc", "one:"));
        mesh.link(echo("two", "Svc", "two:"));
        let out = mesh
            .request_response(&ctx(), &Address::new("Svc", "Echo"), Payload::new("x"))
            .await
            .unwrap();
        assert_eq!(out.data.as_ref(), b"two:x");
    }

    #[tokio::test]
    async fn missing_export_is_reported() {
        let mesh = Mesh::new();
        let err = mesh
            .request_response(&ctx(), &Address::new("Greeter", "SayHello"), Payload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NotExported { .. }));
        assert_eq!(ActionError::from(err).code, Some(ErrorCode::Unimplemented));
    }

    #[tokio::test]
    async fn module_failures_keep_their_code() {
        let mesh = Mesh::new();
        mesh.link(Arc::new(
            NativeModule::builder("store")
                .export("Store", "Get", |_, _| async {
                    Err(ActionError::with_code(ErrorCode::NotFound, "no such key").permanent().into())
                })
                .build(),
        ));
        let err = mesh
            .request_response(&ctx(), &Address::new("Store", "Get"), Payload::default())
            .await
            .unwrap_err();
        let err = ActionError::from(err);
        assert_eq!(err.code, Some(ErrorCode::NotFound));
        assert_eq!(err.message, "no such key");
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn imports_are_satisfied_by_later_links() {
        let mesh = Mesh::new();
        let caller = Arc::new(
            NativeModule::builder("caller")
                .import("Svc", "Echo")
                .export("Front", "Call", |imports: Imports, payload| async move {
                    imports.request_response("Svc", "Echo", payload).await
                })
                .build(),
        );
        mesh.link(caller);
        assert_eq!(mesh.unsatisfied().len(), 1);
        assert!(matches!(mesh.check(), Err(MeshError::Unsatisfied(ref a)) if a == &[Address::new("Svc", "Echo")]));

        mesh.link(echo("echo", "Svc", "echo:"));
        assert!(mesh.check().is_ok());
        let out = mesh
            .request_response(&ctx(), &Address::new("Front", "Call"), Payload::new("hi"))
            .await
            .unwrap();
        assert_eq!(out.data.as_ref(), b"echo:hi");

        // Re-exporting the address re-routes the existing import.
        mesh.link(echo("echo2", "Svc", "echo2:"));
        let out = mesh
            .request_response(&ctx(), &Address::new("Front", "Call"), Payload::new("hi"))
            .await
            .unwrap();
        assert_eq!(out.data.as_ref(), b"echo2:hi");
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_waiters() {
        let mesh = Arc::new(Mesh::new());
        mesh.link(echo("echo", "Svc", ""));
        let waiter = tokio::spawn({
            let mesh = Arc::clone(&mesh);
            async move { mesh.wait_until_shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        mesh.close().await.unwrap();
        waiter.await.unwrap();
    }
}
