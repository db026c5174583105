//! In-process compute modules built from async Rust closures.
//!
//! Export handlers receive the module's [`Imports`] so they can call back
//! through the mesh by address. The imports handed to a handler are bound
//! to the context of the call being served.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::RwLock;
use relaybus_core::{RequestContext, Value};

use super::module::{Direction, Link, Module, Operation, OperationKind, Payload, PayloadStream};
use super::{Address, MeshError};

type UnaryFn = dyn Fn(Imports, Payload) -> BoxFuture<'static, Result<Payload, MeshError>> + Send + Sync;
type StreamFn = dyn Fn(Imports, Payload) -> PayloadStream + Send + Sync;

#[derive(Clone)]
enum Export {
    Unary(Arc<UnaryFn>),
    Stream(Arc<StreamFn>),
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

/// The import slots of a native module, filled in by the mesh as exporters
/// are linked.
#[derive(Clone, Default)]
pub struct Imports {
    by_address: Arc<HashMap<Address, u32>>,
    slots: Arc<RwLock<HashMap<u32, Link>>>,
    ctx: RequestContext,
}

impl Imports {
    fn bind(&self, ctx: &RequestContext) -> Self {
        Self {
            by_address: Arc::clone(&self.by_address),
            slots: Arc::clone(&self.slots),
            ctx: ctx.without_streams(),
        }
    }

    /// Context of the call being served; outgoing calls carry it.
    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// The link for an imported address.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NotExported`] if the address was not declared
    /// as an import or has not been linked yet.
    pub fn get(&self, namespace: &str, operation: &str) -> Result<Link, MeshError> {
        let address = Address::new(namespace, operation);
        self.by_address
            .get(&address)
            .and_then(|index| self.slots.read().get(index).cloned())
            .ok_or(MeshError::NotExported { address })
    }

    /// # Errors
    ///
    /// See [`Imports::get`]; also returns the callee's failure.
    pub async fn request_response(
        &self,
        namespace: &str,
        operation: &str,
        payload: Payload,
    ) -> Result<Payload, MeshError> {
        self.get(namespace, operation)?.request_response(&self.ctx, payload).await
    }

    /// # Errors
    ///
    /// See [`Imports::get`]; also returns the callee's failure.
    pub async fn fire_and_forget(
        &self,
        namespace: &str,
        operation: &str,
        payload: Payload,
    ) -> Result<(), MeshError> {
        self.get(namespace, operation)?.fire_and_forget(&self.ctx, payload).await
    }

    /// # Errors
    ///
    /// See [`Imports::get`].
    pub fn request_stream(
        &self,
        namespace: &str,
        operation: &str,
        payload: Payload,
    ) -> Result<PayloadStream, MeshError> {
        Ok(self.get(namespace, operation)?.request_stream(&self.ctx, payload))
    }

    /// # Errors
    ///
    /// See [`Imports::get`].
    pub fn request_channel(
        &self,
        namespace: &str,
        operation: &str,
        payload: Payload,
        input: PayloadStream,
    ) -> Result<PayloadStream, MeshError> {
        Ok(self.get(namespace, operation)?.request_channel(&self.ctx, payload, input))
    }

    /// MessagePack convenience over [`Imports::request_response`].
    ///
    /// # Errors
    ///
    /// See [`Imports::request_response`]; also fails on undecodable data.
    pub async fn call(&self, namespace: &str, operation: &str, input: &Value) -> Result<Value, MeshError> {
        self.request_response(namespace, operation, Payload::from_value(input)?)
            .await?
            .to_value()
    }
}

// ---------------------------------------------------------------------------
// NativeModule
// ---------------------------------------------------------------------------

pub struct NativeModule {
    name: String,
    operations: Vec<Operation>,
    exports: Vec<Export>,
    imports: Imports,
}

impl NativeModule {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> NativeModuleBuilder {
        NativeModuleBuilder {
            name: name.into(),
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }

    fn export(&self, index: u32) -> Result<&Export, MeshError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.exports.get(i))
            .ok_or(MeshError::UnknownIndex { index })
    }
}

#[async_trait]
impl Module for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> Vec<Operation> {
        self.operations.clone()
    }

    fn link_import(&self, index: u32, link: Link) {
        self.imports.slots.write().insert(index, link);
    }

    async fn request_response(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, MeshError> {
        let index = payload.index();
        match self.export(index)? {
            Export::Unary(f) => f(self.imports.bind(ctx), payload).await,
            Export::Stream(_) => Err(MeshError::Unsupported {
                address: self.export_address(index),
                kind: OperationKind::RequestResponse,
            }),
        }
    }

    fn request_stream(&self, ctx: &RequestContext, payload: Payload) -> PayloadStream {
        let index = payload.index();
        match self.export(index) {
            Ok(Export::Stream(f)) => f(self.imports.bind(ctx), payload),
            Ok(Export::Unary(f)) => {
                // A unary export streams its single response.
                futures_util::stream::once(f(self.imports.bind(ctx), payload)).boxed()
            }
            Err(e) => futures_util::stream::once(async move { Err(e) }).boxed(),
        }
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct NativeModuleBuilder {
    name: String,
    exports: Vec<(Address, OperationKind, Export)>,
    imports: Vec<Address>,
}

impl NativeModuleBuilder {
    /// Exports a request/response operation over raw payloads.
    #[must_use]
    pub fn export<F, Fut>(mut self, namespace: &str, operation: &str, f: F) -> Self
    where
        F: Fn(Imports, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, MeshError>> + Send + 'static,
    {
        let f: Arc<UnaryFn> = Arc::new(move |imports, payload| f(imports, payload).boxed());
        self.exports.push((
            Address::new(namespace, operation),
            OperationKind::RequestResponse,
            Export::Unary(f),
        ));
        self
    }

    /// Exports a request/response operation over MessagePack-encoded values.
    #[must_use]
    pub fn export_value<F, Fut>(self, namespace: &str, operation: &str, f: F) -> Self
    where
        F: Fn(Imports, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MeshError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.export(namespace, operation, move |imports, payload: Payload| {
            let f = Arc::clone(&f);
            async move {
                let input = payload.to_value()?;
                Payload::from_value(&f(imports, input).await?)
            }
        })
    }

    /// Exports a request/stream operation.
    #[must_use]
    pub fn export_stream<F>(mut self, namespace: &str, operation: &str, f: F) -> Self
    where
        F: Fn(Imports, Payload) -> PayloadStream + Send + Sync + 'static,
    {
        self.exports.push((
            Address::new(namespace, operation),
            OperationKind::RequestStream,
            Export::Stream(Arc::new(f)),
        ));
        self
    }

    /// Declares a request/response import.
    #[must_use]
    pub fn import(mut self, namespace: &str, operation: &str) -> Self {
        self.imports.push(Address::new(namespace, operation));
        self
    }

    #[must_use]
    pub fn build(self) -> NativeModule {
        let mut operations = Vec::with_capacity(self.exports.len() + self.imports.len());
        let mut exports = Vec::with_capacity(self.exports.len());
        for (index, (address, kind, export)) in (0_u32..).zip(self.exports) {
            operations.push(Operation {
                index,
                kind,
                direction: Direction::Export,
                namespace: address.namespace,
                operation: address.operation,
            });
            exports.push(export);
        }
        let mut by_address = HashMap::with_capacity(self.imports.len());
        for (index, address) in (0_u32..).zip(self.imports) {
            operations.push(Operation {
                index,
                kind: OperationKind::RequestResponse,
                direction: Direction::Import,
                namespace: address.namespace.clone(),
                operation: address.operation.clone(),
            });
            by_address.insert(address, index);
        }
        NativeModule {
            name: self.name,
            operations,
            exports,
            imports: Imports {
                by_address: Arc::new(by_address),
                slots: Arc::default(),
                ctx: RequestContext::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn value_exports_round_trip_messagepack() {
        let module = NativeModule::builder("math")
            .export_value("Math", "Double", |_, input: Value| async move {
                let n = input.get("n").and_then(Value::as_i64).unwrap_or_default();
                Ok(Value::from(n * 2))
            })
            .build();
        let input = Value::from(json!({"n": 21}));
        let out = module
            .request_response(&RequestContext::default(), Payload::from_value(&input).unwrap())
            .await
            .unwrap();
        assert_eq!(out.to_value().unwrap(), Value::from(42));
    }

    #[tokio::test]
    async fn stream_exports_yield_every_item() {
        let module = NativeModule::builder("counter")
            .export_stream("Count", "To", |_, payload: Payload| {
                let n = payload.data.len();
                stream::iter((0..n).map(|i| Ok(Payload::new(i.to_string())))).boxed()
            })
            .build();
        let items: Vec<_> = module
            .request_stream(&RequestContext::default(), Payload::new("abc"))
            .collect()
            .await;
        let items: Vec<_> = items.into_iter().map(|p| p.unwrap().data).collect();
        assert_eq!(items, vec!["0", "1", "2"]);

        let err = module
            .request_response(&RequestContext::default(), Payload::new("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn handlers_see_the_calling_context() {
        let module = NativeModule::builder("whoami")
            .export_value("Auth", "WhoAmI", |imports: Imports, _| async move {
                let ctx = imports.context();
                Ok(Value::from(json!({"request": ctx.request_id, "sub": ctx.claims.get("sub").cloned()})))
            })
            .build();
        let ctx = RequestContext::new("req-9").with_claims(Value::from(json!({"sub": "ada"})));
        let out = module.request_response(&ctx, Payload::default()).await.unwrap();
        assert_eq!(out.to_value().unwrap(), Value::from(json!({"request": "req-9", "sub": "ada"})));
    }

    #[tokio::test]
    async fn unlinked_import_is_not_exported() {
        let module = NativeModule::builder("caller").import("Store", "Get").build();
        assert_eq!(module.operations()[0].direction, Direction::Import);
        let err = module.imports.call("Store", "Get", &Value::Null).await.unwrap_err();
        assert!(matches!(err, MeshError::NotExported { .. }));
    }

    #[tokio::test]
    async fn bad_index_is_reported() {
        let module = NativeModule::builder("empty").build();
        let mut payload = Payload::default();
        payload.set_index(3);
        let err = module.request_response(&RequestContext::default(), payload).await.unwrap_err();
        assert_eq!(err, MeshError::UnknownIndex { index: 3 });
    }
}
