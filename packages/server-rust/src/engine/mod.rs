//! The composition root: builds the capability table, loads resources,
//! links compute modules and the local pipelines into the mesh, and
//! dispatches invocations.

pub mod errors;

use std::collections::BTreeMap;
use std::sync::Arc;

use relaybus_core::codec::{JsonCodec, MsgPackCodec};
use relaybus_core::{
    ActionError, BusError, CapabilityTable, Coalesce, Codecs, Data, Handler, Interfaces, RequestContext,
    Resolver, ValidationResult, Value,
};

pub use errors::ErrorTranslator;

use crate::actions::decode::CODECS;
use crate::actions::http::HTTP_CLIENT;
use crate::config::BusConfig;
use crate::handle::LateBound;
use crate::logging::{Logger, LOGGER};
use crate::mesh::{Address, ComputeLoaders, Mesh, MeshError, Module, Payload, PipelineModule, MESH};
use crate::processor::{Outcome, Processor};
use crate::registry::{LoadError, Registry, RegistryError};
use crate::resource::{ResourceLoaders, Resources, RESOURCES};
use crate::service::Invocation;
use crate::transport::filter::{Filters, FILTERS};

/// Capability name of the [`EngineHandle`].
pub const INVOKER: &str = "transport:invoker";
/// Capability name of the input schema table ([`Interfaces`]).
pub const NAMESPACES: &str = "spec:namespaces";
/// Capability name of the process [`Environment`].
pub const ENV: &str = "os:env";
pub const JSON_CODEC: &str = "codec:json";
pub const MSGPACK_CODEC: &str = "codec:msgpack";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Environment variables exposed to pipelines as `env`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Snapshot of the process environment. Non-UTF-8 entries are skipped.
    #[must_use]
    pub fn from_process() -> Self {
        Self(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Everything the engine is assembled from besides configuration.
pub struct Components {
    pub registry: Registry,
    pub resource_loaders: ResourceLoaders,
    /// Constructors for the `compute:` section.
    pub compute_loaders: ComputeLoaders,
    /// Compute modules attached in code, linked after the configured ones
    /// and before the local pipelines.
    pub modules: Vec<Arc<dyn Module>>,
    pub environment: Environment,
    pub filters: Filters,
    pub http_client: reqwest::Client,
}

impl Components {
    /// Every built-in action, resource and compute type, the process
    /// environment and the default transport filters.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if two built-ins share a name.
    pub fn with_defaults() -> Result<Self, RegistryError> {
        let mut registry = Registry::new();
        crate::actions::register_all(&mut registry)?;
        Ok(Self {
            registry,
            resource_loaders: ResourceLoaders::with_defaults(),
            compute_loaders: ComputeLoaders::with_defaults(),
            modules: Vec::new(),
            environment: Environment::from_process(),
            filters: Filters::with_defaults(),
            http_client: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

/// The engine as seen by actions through [`INVOKER`].
#[derive(Debug, Clone)]
pub struct EngineHandle(LateBound<Engine>);

impl EngineHandle {
    fn new() -> Self {
        Self(LateBound::new(INVOKER))
    }

    fn bind(&self, engine: &Arc<Engine>) {
        self.0.bind(engine);
    }

    /// # Errors
    ///
    /// See [`Engine::dispatch`]; also `unavailable` if the engine is gone.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        handler: &Handler,
        input: Value,
    ) -> Result<Option<Value>, ActionError> {
        self.0.get()?.dispatch(ctx, handler, input).await
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    id: String,
    mesh: Arc<Mesh>,
    processor: Arc<Processor>,
    schemas: Arc<Interfaces>,
    filters: Arc<Filters>,
    errors: ErrorTranslator,
    env: Value,
}

impl Engine {
    /// Loads `config`: capabilities, then resources, then compute modules,
    /// then local pipelines. Fails if any module import is left unsatisfied.
    ///
    /// # Errors
    ///
    /// Returns the first resource, pipeline, template or link failure.
    pub fn load(config: &BusConfig, components: Components) -> Result<Arc<Self>, EngineError> {
        let mesh = Arc::new(Mesh::new());
        let handle = EngineHandle::new();
        let schemas = Arc::new(schema_table(config));
        let filters = Arc::new(components.filters);
        let env = components.environment.to_value();

        let mut table = CapabilityTable::new();
        table.insert(LOGGER, Logger::new(&config.id));
        table.insert(HTTP_CLIENT, components.http_client);
        table.insert(CODECS, Codecs::with_defaults());
        table.insert(JSON_CODEC, JsonCodec);
        table.insert(MSGPACK_CODEC, MsgPackCodec);
        table.insert_arc(MESH, Arc::clone(&mesh));
        table.insert_arc(NAMESPACES, Arc::clone(&schemas));
        table.insert_arc(FILTERS, Arc::clone(&filters));
        table.insert(ENV, components.environment);
        table.insert(INVOKER, handle.clone());
        let resolver = Resolver::from_table(table);

        let resources = Resources::load(&config.resources, &components.resource_loaders, &resolver)?;
        let resolver = resolver.overlay(RESOURCES, Arc::new(resources));

        let configured = components.compute_loaders.load(&config.compute, &resolver)?;
        for module in configured.into_iter().chain(components.modules) {
            mesh.link(module);
        }
        let processor = Processor::load(config, Arc::new(components.registry), &resolver)?;
        mesh.link(Arc::new(PipelineModule::new(&processor, env.clone())));
        mesh.check()?;

        let engine = Arc::new(Self {
            id: config.id.clone(),
            mesh,
            processor,
            schemas,
            filters,
            errors: ErrorTranslator::new(&config.errors)?,
            env,
        });
        handle.bind(&engine);
        tracing::info!(bus = %engine.id, operations = engine.processor.operations().len(), "engine loaded");
        Ok(engine)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    #[must_use]
    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    #[must_use]
    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    /// Runs an invocation to completion and translates any failure through
    /// the configured error templates. A missing result is `null`.
    ///
    /// # Errors
    ///
    /// Returns the translated [`BusError`].
    pub async fn invoke(&self, invocation: Invocation) -> Result<Value, BusError> {
        let Invocation {
            ctx, handler, input, ..
        } = invocation;
        match self.dispatch(&ctx, &handler, input).await {
            Ok(value) => Ok(value.unwrap_or_default()),
            Err(err) => {
                let err = self.errors.translate(&err);
                tracing::debug!(handler = %handler, code = %err.code, error = %err.message, "invocation failed");
                Err(err)
            }
        }
    }

    /// Coerces `input` against the operation's schema, then runs the local
    /// pipeline bound to `handler` or, when there is none, the mesh export
    /// of the same address.
    ///
    /// # Errors
    ///
    /// `invalid_argument` for schema violations, `unimplemented` when
    /// nothing serves `handler`, otherwise the pipeline's or module's error.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        handler: &Handler,
        mut input: Value,
    ) -> Result<Option<Value>, ActionError> {
        if let Some(schema) = self.schemas.get(handler) {
            if let ValidationResult::Invalid { errors } = schema.coalesce(&mut input) {
                return Err(BusError::invalid_argument(errors.join("; ")).into());
            }
        }

        if self.processor.has_operation(handler) {
            let mut data = Data::for_request(input, ctx.claims.clone(), self.env.clone());
            let outcome = self.processor.invoke(ctx, handler, &mut data).await?;
            return Ok(outcome.and_then(Outcome::into_value));
        }

        let response = self
            .mesh
            .request_response(ctx, &Address::from(handler), Payload::from_value(&input)?)
            .await;
        match response {
            Ok(payload) if payload.data.is_empty() => Ok(None),
            Ok(payload) => Ok(Some(payload.to_value()?)),
            Err(MeshError::NotExported { .. }) => {
                Err(BusError::unimplemented(format!("{handler} is not implemented")).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Closes every linked compute module.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Close`] listing each module that failed.
    pub async fn close(&self) -> Result<(), MeshError> {
        self.mesh.close().await
    }
}

fn schema_table(config: &BusConfig) -> Interfaces {
    let mut schemas = Interfaces::new();
    for (interface, operations) in &config.schemas {
        for (operation, schema) in operations {
            schemas.insert(Handler::new(interface, operation), schema.clone());
        }
    }
    schemas
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("mesh", &self.mesh)
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}
