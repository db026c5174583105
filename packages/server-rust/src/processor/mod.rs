//! The pipeline processor: compiles configured pipelines into runnable
//! steps once, then serves named pipelines, interface operations and
//! provider operations per request.

pub mod pipeline;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use relaybus_core::{ActionError, Capability, Data, Handler, RequestContext, Resolver};

pub use pipeline::{Outcome, Pipeline, Step};

use crate::config::{BusConfig, Namespaces, PipelineConfig, StepConfig};
use crate::handle::LateBound;
use crate::registry::{LoadError, Registry};
use crate::resiliency::Policies;

/// Capability name under which the processor is visible to loaders.
pub const PROCESSOR: &str = "system:processor";

/// Alias of [`PROCESSOR`] for loaders that dispatch across every
/// configured namespace.
pub const INTERFACES: &str = "system:interfaces";

#[derive(Debug, Default)]
struct Tables {
    pipelines: HashMap<String, Arc<Pipeline>>,
    interfaces: HashMap<Handler, Arc<Pipeline>>,
    providers: HashMap<Handler, Arc<Pipeline>>,
}

fn load_namespaces(
    processor: &Processor,
    namespaces: &Namespaces,
) -> Result<HashMap<Handler, Arc<Pipeline>>, LoadError> {
    let mut table = HashMap::new();
    for (interface, operations) in namespaces {
        for (operation, config) in operations {
            let handler = Handler::new(interface, operation);
            let pipeline = processor.load_pipeline(&handler.to_string(), config)?;
            table.insert(handler, pipeline);
        }
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct Processor {
    registry: Arc<Registry>,
    policies: Policies,
    resolver: Resolver,
    tables: ArcSwap<Tables>,
}

impl Processor {
    /// Compiles every pipeline in `config`.
    ///
    /// Loaders see `resolver` plus [`PROCESSOR`], which is usable from the
    /// moment the first loader runs so that control-flow actions can compile
    /// nested pipelines.
    ///
    /// # Errors
    ///
    /// Returns the first [`LoadError`]: an unregistered action, an
    /// unresolvable dependency, malformed step configuration or an undefined
    /// policy.
    pub fn load(
        config: &BusConfig,
        registry: Arc<Registry>,
        resolver: &Resolver,
    ) -> Result<Arc<Self>, LoadError> {
        let handle = ProcessorHandle::new();
        let capability: Capability = Arc::new(handle.clone());
        let processor = Arc::new(Self {
            registry,
            policies: Policies::from_config(&config.resiliency),
            resolver: resolver
                .overlay(PROCESSOR, Arc::clone(&capability))
                .overlay(INTERFACES, capability),
            tables: ArcSwap::from_pointee(Tables::default()),
        });
        handle.bind(&processor);

        let mut pipelines = HashMap::with_capacity(config.pipelines.len());
        for (name, pipeline) in &config.pipelines {
            pipelines.insert(name.clone(), processor.load_pipeline(name, pipeline)?);
        }
        let tables = Tables {
            pipelines,
            providers: load_namespaces(&processor, &config.providers)?,
            interfaces: load_namespaces(&processor, &config.interfaces)?,
        };
        tracing::debug!(
            pipelines = tables.pipelines.len(),
            interfaces = tables.interfaces.len(),
            providers = tables.providers.len(),
            "processor loaded"
        );
        processor.tables.store(Arc::new(tables));
        Ok(processor)
    }

    /// The resolver loaders see, including [`PROCESSOR`].
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Compiles a pipeline. Unnamed steps are named `Step <index>`.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError::Step`] naming the offending step.
    pub fn load_pipeline(&self, name: &str, config: &PipelineConfig) -> Result<Arc<Pipeline>, LoadError> {
        let name = config.name.as_deref().unwrap_or(name);
        let steps = config
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| self.load_step(name, index, step))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Pipeline::new(name, steps)))
    }

    fn load_step(&self, pipeline: &str, index: usize, config: &StepConfig) -> Result<Step, LoadError> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("Step {index}"));
        let wrap = |source: LoadError| LoadError::Step {
            pipeline: pipeline.to_string(),
            step: name.clone(),
            source: Box::new(source),
        };

        let action = self
            .registry
            .load(&config.uses, &config.with, &self.resolver)
            .map_err(wrap)?;
        let action = self.policies.wrap(action, config).map_err(wrap)?;
        let on_error = config
            .on_error
            .as_ref()
            .map(|recovery| self.load_pipeline(&format!("{pipeline}/{name}/onError"), recovery))
            .transpose()
            .map_err(wrap)?;

        Ok(Step {
            name,
            uses: config.uses.clone(),
            returns: config.returns.clone(),
            action,
            on_error,
        })
    }

    /// Runs a named pipeline. `Ok(None)` when no such pipeline exists.
    ///
    /// # Errors
    ///
    /// Propagates the pipeline's error.
    pub async fn pipeline(
        &self,
        ctx: &RequestContext,
        name: &str,
        data: &mut Data,
    ) -> Result<Option<Outcome>, ActionError> {
        let pipeline = self.tables.load().pipelines.get(name).cloned();
        run_optional(pipeline, ctx, data).await
    }

    /// Runs the interface operation bound to `handler`, if any.
    ///
    /// # Errors
    ///
    /// Propagates the pipeline's error.
    pub async fn interface(
        &self,
        ctx: &RequestContext,
        handler: &Handler,
        data: &mut Data,
    ) -> Result<Option<Outcome>, ActionError> {
        let pipeline = self.tables.load().interfaces.get(handler).cloned();
        run_optional(pipeline, ctx, data).await
    }

    /// Runs the provider operation bound to `handler`, if any.
    ///
    /// # Errors
    ///
    /// Propagates the pipeline's error.
    pub async fn provider(
        &self,
        ctx: &RequestContext,
        handler: &Handler,
        data: &mut Data,
    ) -> Result<Option<Outcome>, ActionError> {
        let pipeline = self.tables.load().providers.get(handler).cloned();
        run_optional(pipeline, ctx, data).await
    }

    /// Local dispatch: interfaces first, then providers. `Ok(None)` means
    /// nothing local is bound and the caller should fall through to the
    /// mesh.
    ///
    /// # Errors
    ///
    /// Propagates the pipeline's error.
    pub async fn invoke(
        &self,
        ctx: &RequestContext,
        handler: &Handler,
        data: &mut Data,
    ) -> Result<Option<Outcome>, ActionError> {
        let pipeline = {
            let tables = self.tables.load();
            tables
                .interfaces
                .get(handler)
                .or_else(|| tables.providers.get(handler))
                .cloned()
        };
        run_optional(pipeline, ctx, data).await
    }

    #[must_use]
    pub fn has_operation(&self, handler: &Handler) -> bool {
        let tables = self.tables.load();
        tables.interfaces.contains_key(handler) || tables.providers.contains_key(handler)
    }

    /// Every locally bound operation, interfaces and providers, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<Handler> {
        let tables = self.tables.load();
        let mut handlers: Vec<Handler> = tables
            .interfaces
            .keys()
            .chain(tables.providers.keys())
            .cloned()
            .collect();
        handlers.sort();
        handlers.dedup();
        handlers
    }
}

async fn run_optional(
    pipeline: Option<Arc<Pipeline>>,
    ctx: &RequestContext,
    data: &mut Data,
) -> Result<Option<Outcome>, ActionError> {
    match pipeline {
        Some(pipeline) => pipeline.run(ctx, data).await.map(Some),
        None => Ok(None),
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("operations", &self.operations())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ProcessorHandle
// ---------------------------------------------------------------------------

/// The processor as seen by actions through [`PROCESSOR`].
#[derive(Debug, Clone)]
pub struct ProcessorHandle(LateBound<Processor>);

impl ProcessorHandle {
    fn new() -> Self {
        Self(LateBound::new(PROCESSOR))
    }

    fn bind(&self, processor: &Arc<Processor>) {
        self.0.bind(processor);
    }

    /// # Errors
    ///
    /// Returns `unavailable` if the processor is gone.
    pub fn get(&self) -> Result<Arc<Processor>, ActionError> {
        self.0.get()
    }

    /// Compiles a nested pipeline (route branches and similar).
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] for bad steps.
    pub fn load_pipeline(&self, name: &str, config: &PipelineConfig) -> Result<Arc<Pipeline>, LoadError> {
        let processor = self.0.get().map_err(|e| LoadError::invalid(name, e))?;
        processor.load_pipeline(name, config)
    }

    /// # Errors
    ///
    /// See [`Processor::pipeline`].
    pub async fn pipeline(
        &self,
        ctx: &RequestContext,
        name: &str,
        data: &mut Data,
    ) -> Result<Option<Outcome>, ActionError> {
        self.get()?.pipeline(ctx, name, data).await
    }

    /// # Errors
    ///
    /// See [`Processor::interface`].
    pub async fn interface(
        &self,
        ctx: &RequestContext,
        handler: &Handler,
        data: &mut Data,
    ) -> Result<Option<Outcome>, ActionError> {
        self.get()?.interface(ctx, handler, data).await
    }

    /// # Errors
    ///
    /// See [`Processor::provider`].
    pub async fn provider(
        &self,
        ctx: &RequestContext,
        handler: &Handler,
        data: &mut Data,
    ) -> Result<Option<Outcome>, ActionError> {
        self.get()?.provider(ctx, handler, data).await
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::{FnAction, Flow, Value};

    use super::*;
    use crate::registry::NamedLoader;

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry
            .register(NamedLoader::new("const", |with, _| {
                let value = with.clone();
                Ok(Arc::new(FnAction::new(move |_ctx, data| {
                    let value = value.clone();
                    async move { Ok((data, Flow::value(value))) }
                })))
            }))
            .unwrap();
        registry
            .register(NamedLoader::new("needs_processor", |_, resolver| {
                let _handle: Arc<ProcessorHandle> = resolver.resolve(PROCESSOR)?;
                Ok(Arc::new(FnAction::new(|_ctx, data| async move { Ok((data, Flow::next())) })))
            }))
            .unwrap();
        Arc::new(registry)
    }

    fn config(yaml: &str) -> BusConfig {
        BusConfig::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn serves_interfaces_before_providers_and_named_pipelines() {
        let config = config(
            r"
pipelines:
  shared:
    steps:
      - uses: const
        with: shared
interfaces:
  Greeter:
    SayHello:
      steps:
        - uses: needs_processor
        - uses: const
          with: interface
providers:
  Greeter:
    SayHello:
      steps:
        - uses: const
          with: provider
    Other:
      steps:
        - uses: const
          with: other
",
        );
        let processor = Processor::load(&config, registry(), &Resolver::empty()).unwrap();
        let ctx = RequestContext::default();
        let hello = Handler::new("Greeter", "SayHello");

        let out = processor.invoke(&ctx, &hello, &mut Data::new()).await.unwrap();
        assert_eq!(out.unwrap().into_value(), Some(Value::from("interface")));

        let out = processor.provider(&ctx, &hello, &mut Data::new()).await.unwrap();
        assert_eq!(out.unwrap().into_value(), Some(Value::from("provider")));

        let out = processor.pipeline(&ctx, "shared", &mut Data::new()).await.unwrap();
        assert_eq!(out.unwrap().into_value(), Some(Value::from("shared")));

        let missing = Handler::new("Greeter", "Nope");
        assert!(processor.invoke(&ctx, &missing, &mut Data::new()).await.unwrap().is_none());
        assert_eq!(processor.operations().len(), 2);
    }

    #[test]
    fn unknown_action_names_the_step() {
        let config = config(
            r"
interfaces:
  Svc:
    Op:
      steps:
        - uses: const
        - uses: missing
",
        );
        let err = Processor::load(&config, registry(), &Resolver::empty()).unwrap_err();
        match err {
            LoadError::Step { pipeline, step, source } => {
                assert_eq!(pipeline, "Svc::Op");
                assert_eq!(step, "Step 1");
                assert!(matches!(*source, LoadError::UnknownAction { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn undefined_policy_fails_load() {
        let config = config(
            r"
interfaces:
  Svc:
    Op:
      steps:
        - uses: const
          retry: missing
",
        );
        assert!(Processor::load(&config, registry(), &Resolver::empty()).is_err());
    }
}
