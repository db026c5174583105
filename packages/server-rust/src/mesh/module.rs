//! Compute module contract, operation descriptors and payloads.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use relaybus_core::{RequestContext, Value};

use super::{Address, MeshError};

/// Bytes of metadata carried by every payload.
pub const METADATA_LEN: usize = 8;

/// Stream of payloads for the streaming interaction kinds.
pub type PayloadStream = BoxStream<'static, Result<Payload, MeshError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    RequestResponse,
    FireAndForget,
    RequestStream,
    RequestChannel,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestResponse => "request/response",
            Self::FireAndForget => "fire-and-forget",
            Self::RequestStream => "request/stream",
            Self::RequestChannel => "request/channel",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Served by the module.
    Export,
    /// Called by the module.
    Import,
}

/// One operation a module exports or imports. `index` is the module-local
/// slot the mesh stamps into payload metadata when calling an export, and
/// the slot it wires when satisfying an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub index: u32,
    pub kind: OperationKind,
    pub direction: Direction,
    pub namespace: String,
    pub operation: String,
}

impl Operation {
    #[must_use]
    pub fn address(&self) -> Address {
        Address::new(&self.namespace, &self.operation)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Data bytes plus fixed-size metadata. The first four metadata bytes hold
/// the big-endian index of the destination operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub data: Bytes,
    pub metadata: [u8; METADATA_LEN],
}

impl Payload {
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: [0; METADATA_LEN],
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        let [a, b, c, d, ..] = self.metadata;
        u32::from_be_bytes([a, b, c, d])
    }

    pub fn set_index(&mut self, index: u32) {
        self.metadata[..4].copy_from_slice(&index.to_be_bytes());
    }

    /// MessagePack-encodes `value`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Payload`] if the value cannot be encoded.
    pub fn from_value(value: &Value) -> Result<Self, MeshError> {
        rmp_serde::to_vec_named(value)
            .map(Self::new)
            .map_err(|e| MeshError::Payload(e.to_string()))
    }

    /// Decodes MessagePack data. Empty data is `null`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Payload`] for malformed data.
    pub fn to_value(&self) -> Result<Value, MeshError> {
        if self.data.is_empty() {
            return Ok(Value::Null);
        }
        rmp_serde::from_slice(&self.data).map_err(|e| MeshError::Payload(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

/// A unit of compiled business logic linked into the mesh.
///
/// Calls into a module carry the target export's index in the payload
/// metadata and the caller's [`RequestContext`], whose request id and
/// claims follow the call into any callback the module makes. Interaction
/// kinds a module does not serve keep the default implementations, which
/// fail with [`MeshError::Unsupported`].
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn operations(&self) -> Vec<Operation>;

    /// Wires import slot `index` to the export behind `link`.
    fn link_import(&self, index: u32, link: Link);

    async fn request_response(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, MeshError>;

    async fn fire_and_forget(&self, ctx: &RequestContext, payload: Payload) -> Result<(), MeshError> {
        self.request_response(ctx, payload).await.map(drop)
    }

    fn request_stream(&self, _ctx: &RequestContext, payload: Payload) -> PayloadStream {
        unsupported(self.export_address(payload.index()), OperationKind::RequestStream)
    }

    fn request_channel(&self, _ctx: &RequestContext, payload: Payload, _input: PayloadStream) -> PayloadStream {
        unsupported(self.export_address(payload.index()), OperationKind::RequestChannel)
    }

    async fn close(&self) -> Result<(), MeshError> {
        Ok(())
    }

    /// Address of export slot `index`, for error reporting.
    fn export_address(&self, index: u32) -> Address {
        self.operations()
            .into_iter()
            .find(|op| op.direction == Direction::Export && op.index == index)
            .map_or_else(|| Address::new(self.name(), index.to_string()), |op| op.address())
    }
}

fn unsupported(address: Address, kind: OperationKind) -> PayloadStream {
    stream::once(async move { Err(MeshError::Unsupported { address, kind }) }).boxed()
}

// ---------------------------------------------------------------------------
// Destination / Link
// ---------------------------------------------------------------------------

/// An export: the module serving it and its slot there.
#[derive(Clone)]
pub struct Destination {
    module: Arc<dyn Module>,
    index: u32,
    address: Address,
}

impl Destination {
    pub(crate) fn new(module: Arc<dyn Module>, op: &Operation) -> Self {
        Self {
            module,
            index: op.index,
            address: op.address(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    fn stamp(&self, mut payload: Payload) -> Payload {
        payload.set_index(self.index);
        payload
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("module", &self.module.name())
            .field("index", &self.index)
            .field("address", &self.address)
            .finish()
    }
}

/// Shared cell holding the current destination of an address. Importers
/// keep the cell, so a later export of the same address re-routes them.
#[derive(Clone)]
pub struct Link(Arc<ArcSwap<Destination>>);

impl Link {
    pub(crate) fn new(destination: Destination) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(destination)))
    }

    pub(crate) fn replace(&self, destination: Destination) {
        self.0.store(Arc::new(destination));
    }

    #[must_use]
    pub fn destination(&self) -> Arc<Destination> {
        self.0.load_full()
    }

    /// # Errors
    ///
    /// Returns the destination module's failure.
    pub async fn request_response(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, MeshError> {
        let dest = self.destination();
        dest.module.request_response(ctx, dest.stamp(payload)).await
    }

    /// # Errors
    ///
    /// Returns the destination module's failure.
    pub async fn fire_and_forget(&self, ctx: &RequestContext, payload: Payload) -> Result<(), MeshError> {
        let dest = self.destination();
        dest.module.fire_and_forget(ctx, dest.stamp(payload)).await
    }

    #[must_use]
    pub fn request_stream(&self, ctx: &RequestContext, payload: Payload) -> PayloadStream {
        let dest = self.destination();
        dest.module.request_stream(ctx, dest.stamp(payload))
    }

    #[must_use]
    pub fn request_channel(&self, ctx: &RequestContext, payload: Payload, input: PayloadStream) -> PayloadStream {
        let dest = self.destination();
        dest.module.request_channel(ctx, dest.stamp(payload), input)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Link").field(&self.destination()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_big_endian_in_first_four_bytes() {
        let mut payload = Payload::new("x");
        payload.set_index(0x0102_0304);
        assert_eq!(payload.metadata, [1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(payload.index(), 0x0102_0304);
    }

    #[test]
    fn empty_payload_decodes_to_null() {
        assert_eq!(Payload::default().to_value().unwrap(), Value::Null);
        let value = Value::from(serde_json::json!({"name": "Ada", "tags": [1, 2]}));
        assert_eq!(Payload::from_value(&value).unwrap().to_value().unwrap(), value);
        assert!(matches!(Payload::new(&b"\xc1"[..]).to_value(), Err(MeshError::Payload(_))));
    }
}
