use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relaybus_core::{Action, ExprError, ResolveError, Resolver, Value};
use serde::de::DeserializeOwned;

use crate::config::ConfigError;

// ---------------------------------------------------------------------------
// LoadError
// ---------------------------------------------------------------------------

/// Failure while turning configuration into runnable steps. Aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unregistered action {name:?}")]
    UnknownAction { name: String },
    #[error("undefined {kind} policy {name:?}")]
    UnknownPolicy { kind: &'static str, name: String },
    #[error("unregistered resource type {name:?}")]
    UnknownResourceType { name: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("invalid configuration for {action:?}: {message}")]
    InvalidConfig { action: String, message: String },
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("pipeline {pipeline:?} step {step:?}: {source}")]
    Step {
        pipeline: String,
        step: String,
        #[source]
        source: Box<LoadError>,
    },
    #[error("resource {name:?}: {source}")]
    Resource {
        name: String,
        #[source]
        source: Box<LoadError>,
    },
    #[error("unregistered compute type {name:?}")]
    UnknownComputeType { name: String },
    #[error("compute {uses:?}: {source}")]
    Compute {
        uses: String,
        #[source]
        source: Box<LoadError>,
    },
}

impl LoadError {
    #[must_use]
    pub fn invalid(action: &str, message: impl fmt::Display) -> Self {
        Self::InvalidConfig {
            action: action.to_string(),
            message: message.to_string(),
        }
    }
}

/// Decodes an action's `with` block into its typed configuration.
///
/// A missing block decodes as an empty map so that configs whose fields all
/// have defaults need no `with` at all.
///
/// # Errors
///
/// Returns [`LoadError::InvalidConfig`] if the block does not match `T`.
pub fn decode_config<T: DeserializeOwned>(action: &str, with: &Value) -> Result<T, LoadError> {
    let with = if with.is_null() {
        Value::Map(std::collections::BTreeMap::new())
    } else {
        with.clone()
    };
    with.decode().map_err(|e| LoadError::invalid(action, e))
}

// ---------------------------------------------------------------------------
// NamedLoader
// ---------------------------------------------------------------------------

/// Builds an action once from its declared configuration and resolved
/// collaborators.
pub type LoaderFn = dyn Fn(&Value, &Resolver) -> Result<Arc<dyn Action>, LoadError> + Send + Sync;

/// A loader paired with the action name it is installed under.
#[derive(Clone)]
pub struct NamedLoader {
    name: String,
    loader: Arc<LoaderFn>,
}

impl NamedLoader {
    pub fn new(
        name: impl Into<String>,
        loader: impl Fn(&Value, &Resolver) -> Result<Arc<dyn Action>, LoadError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            loader: Arc::new(loader),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the loader.
    ///
    /// # Errors
    ///
    /// Propagates the loader's failure.
    pub fn load(&self, with: &Value, resolver: &Resolver) -> Result<Arc<dyn Action>, LoadError> {
        (self.loader)(with, resolver)
    }
}

impl fmt::Debug for NamedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLoader").field("name", &self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("action {0:?} is already registered")]
pub struct RegistryError(pub String);

/// The closed set of installed action loaders.
///
/// Assembled by explicit `register` calls at startup, then frozen by moving
/// it into an `Arc` shared with the processor.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    loaders: HashMap<String, NamedLoader>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a loader.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the name is already taken.
    pub fn register(&mut self, loader: NamedLoader) -> Result<(), RegistryError> {
        if self.loaders.contains_key(loader.name()) {
            return Err(RegistryError(loader.name().to_string()));
        }
        self.loaders.insert(loader.name().to_string(), loader);
        Ok(())
    }

    /// Installs several loaders, stopping at the first duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for the first duplicate name.
    pub fn register_all(
        &mut self,
        loaders: impl IntoIterator<Item = NamedLoader>,
    ) -> Result<(), RegistryError> {
        loaders.into_iter().try_for_each(|l| self.register(l))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NamedLoader> {
        self.loaders.get(name)
    }

    /// Builds the action installed under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownAction`] for unregistered names, or the
    /// loader's own failure.
    pub fn load(
        &self,
        name: &str,
        with: &Value,
        resolver: &Resolver,
    ) -> Result<Arc<dyn Action>, LoadError> {
        self.get(name)
            .ok_or_else(|| LoadError::UnknownAction {
                name: name.to_string(),
            })?
            .load(with, resolver)
    }

    /// Installed names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.loaders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
