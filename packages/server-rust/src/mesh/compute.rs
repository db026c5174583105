//! Compute modules declared in the `compute:` section.
//!
//! Each entry names a compute type (`uses`) whose loader builds a
//! [`Module`] from the entry's `with` block. The built-in `rpc` type
//! forwards its declared exports to another relaybus instance over the
//! HTTP RPC transport, passing the caller's request id and claims in the
//! headers that transport's filters read.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{ActionError, BusError, ErrorCode, RequestContext, Resolver, Value};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use super::module::{Direction, Link, Module, Operation, OperationKind, Payload};
use super::{Address, MeshError};
use crate::actions::http::HTTP_CLIENT;
use crate::config::ComponentConfig;
use crate::registry::{decode_config, LoadError};
use crate::transport::filter::{CLAIMS_HEADER, REQUEST_ID_HEADER};

pub type ComputeLoaderFn = dyn Fn(&Value, &Resolver) -> Result<Arc<dyn Module>, LoadError> + Send + Sync;

/// Compute type name -> constructor.
#[derive(Clone, Default)]
pub struct ComputeLoaders {
    loaders: HashMap<String, Arc<ComputeLoaderFn>>,
}

impl ComputeLoaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loaders for the built-in compute types.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut loaders = Self::new();
        loaders.register(RpcModule::TYPE, |with, resolver| {
            Ok(Arc::new(RpcModule::load(with, resolver)?))
        });
        loaders
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        loader: impl Fn(&Value, &Resolver) -> Result<Arc<dyn Module>, LoadError> + Send + Sync + 'static,
    ) {
        self.loaders.insert(name.into(), Arc::new(loader));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ComputeLoaderFn>> {
        self.loaders.get(name)
    }

    /// Builds every declared module, in order.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownComputeType`] for an unregistered `uses`,
    /// or the loader's failure wrapped in [`LoadError::Compute`].
    pub fn load(
        &self,
        declared: &[ComponentConfig],
        resolver: &Resolver,
    ) -> Result<Vec<Arc<dyn Module>>, LoadError> {
        declared
            .iter()
            .map(|component| {
                let loader = self
                    .get(&component.uses)
                    .ok_or_else(|| LoadError::UnknownComputeType {
                        name: component.uses.clone(),
                    })?;
                let module = loader(&component.with, resolver).map_err(|source| LoadError::Compute {
                    uses: component.uses.clone(),
                    source: Box::new(source),
                })?;
                tracing::info!(uses = %component.uses, module = module.name(), "compute module loaded");
                Ok(module)
            })
            .collect()
    }
}

impl fmt::Debug for ComputeLoaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.loaders.keys().collect();
        names.sort();
        f.debug_struct("ComputeLoaders").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// rpc
// ---------------------------------------------------------------------------

const MSGPACK: &str = "application/msgpack";

#[derive(Debug, Deserialize)]
struct RpcConfig {
    /// Base URL of the remote transport.
    url: String,
    #[serde(default)]
    name: Option<String>,
    /// Interface -> operations served remotely.
    exports: BTreeMap<String, Vec<String>>,
}

/// Request/response exports served by a remote relaybus. Remote failures
/// keep their code, type and metadata.
pub struct RpcModule {
    name: String,
    base: String,
    exports: Vec<Address>,
    client: Arc<reqwest::Client>,
}

impl RpcModule {
    pub const TYPE: &'static str = "rpc";

    /// # Errors
    ///
    /// Returns [`LoadError::InvalidConfig`] for a malformed `with` block or
    /// an empty export list, and [`LoadError::Resolve`] without an HTTP
    /// client.
    pub fn load(with: &Value, resolver: &Resolver) -> Result<Self, LoadError> {
        let config: RpcConfig = decode_config(Self::TYPE, with)?;
        let exports: Vec<Address> = config
            .exports
            .iter()
            .flat_map(|(interface, operations)| operations.iter().map(move |op| Address::new(interface, op)))
            .collect();
        if exports.is_empty() {
            return Err(LoadError::invalid(Self::TYPE, "no exports declared"));
        }
        let base = config.url.trim_end_matches('/').to_string();
        Ok(Self {
            name: config.name.unwrap_or_else(|| base.clone()),
            base,
            exports,
            client: resolver.resolve(HTTP_CLIENT)?,
        })
    }

    fn unavailable(&self, err: &reqwest::Error) -> MeshError {
        ActionError::with_code(ErrorCode::Unavailable, format!("{}: {err}", self.name))
            .retriable()
            .into()
    }
}

#[async_trait]
impl Module for RpcModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> Vec<Operation> {
        (0_u32..)
            .zip(&self.exports)
            .map(|(index, address)| Operation {
                index,
                kind: OperationKind::RequestResponse,
                direction: Direction::Export,
                namespace: address.namespace.clone(),
                operation: address.operation.clone(),
            })
            .collect()
    }

    fn link_import(&self, _index: u32, _link: Link) {}

    async fn request_response(&self, ctx: &RequestContext, payload: Payload) -> Result<Payload, MeshError> {
        let index = payload.index();
        let address = usize::try_from(index)
            .ok()
            .and_then(|i| self.exports.get(i))
            .ok_or(MeshError::UnknownIndex { index })?;
        let url = format!("{}/{}/{}", self.base, address.namespace, address.operation);

        let mut request = self.client.post(&url).header(CONTENT_TYPE, MSGPACK).body(payload.data);
        if !ctx.request_id.is_empty() {
            request = request.header(REQUEST_ID_HEADER, ctx.request_id.as_str());
        }
        if !ctx.claims.is_null() {
            let claims = serde_json::Value::from(ctx.claims.clone());
            request = request.header(CLAIMS_HEADER, claims.to_string());
        }
        let response = request.send().await.map_err(|e| self.unavailable(&e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.unavailable(&e))?;
        if status.is_success() {
            return Ok(Payload::new(body));
        }

        tracing::debug!(%url, %status, "remote operation failed");
        let err = rmp_serde::from_slice::<BusError>(&body).unwrap_or_else(|_| {
            let code = ErrorCode::from_http_status(status.as_u16());
            BusError::new(code, String::from_utf8_lossy(&body).into_owned())
        });
        Err(ActionError::from(err).into())
    }
}

impl fmt::Debug for RpcModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcModule")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::CapabilityTable;
    use serde_json::json;

    use super::*;
    use crate::mesh::NativeModule;

    fn resolver() -> Resolver {
        let mut table = CapabilityTable::new();
        table.insert(HTTP_CLIENT, reqwest::Client::new());
        Resolver::from_table(table)
    }

    fn component(uses: &str, with: serde_json::Value) -> ComponentConfig {
        ComponentConfig {
            uses: uses.to_string(),
            with: Value::from(with),
        }
    }

    #[test]
    fn loads_declared_modules_in_order() {
        let mut loaders = ComputeLoaders::with_defaults();
        loaders.register("echo", |with, _| {
            let name = with.get("name").map(Value::to_display_string).unwrap_or_default();
            Ok(Arc::new(NativeModule::builder(name).build()))
        });
        let declared = [
            component("echo", json!({"name": "first"})),
            component("rpc", json!({"url": "http://remote:8080/", "exports": {"Pricing": ["Quote", "Ping"]}})),
        ];
        let modules = loaders.load(&declared, &resolver()).unwrap();
        let names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["first", "http://remote:8080"]);
        let exported: Vec<String> = modules[1].operations().iter().map(|op| op.address().to_string()).collect();
        assert_eq!(exported, vec!["Pricing::Quote", "Pricing::Ping"]);
    }

    #[test]
    fn unknown_type_and_bad_config_fail_loading() {
        let loaders = ComputeLoaders::with_defaults();
        let err = loaders.load(&[component("wasm", json!({}))], &resolver()).err().unwrap();
        assert!(matches!(err, LoadError::UnknownComputeType { ref name } if name == "wasm"));

        let err = loaders
            .load(&[component("rpc", json!({"url": "http://remote", "exports": {}}))], &resolver())
            .err().unwrap();
        assert!(matches!(err, LoadError::Compute { ref uses, .. } if uses == "rpc"));
    }

    #[tokio::test]
    async fn unreachable_remote_is_unavailable() {
        let module = RpcModule::load(
            &Value::from(json!({"url": "http://127.0.0.1:1", "exports": {"Pricing": ["Quote"]}})),
            &resolver(),
        )
        .unwrap();
        let err = module
            .request_response(&RequestContext::new("t"), Payload::default())
            .await
            .unwrap_err();
        let err = ActionError::from(err);
        assert_eq!(err.code, Some(ErrorCode::Unavailable));
        assert!(err.is_retriable());
    }
}
