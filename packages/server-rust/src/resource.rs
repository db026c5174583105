//! Long-lived resources (connection pools, buckets) created once from the
//! `resources:` section and shared read-only by every action.

use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use relaybus_core::{Capability, ResolveError, Resolver, Value};

use crate::config::ComponentConfig;
use crate::registry::LoadError;

/// Capability name of the [`Resources`] table.
pub const RESOURCES: &str = "resource:lookup";

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Name -> resource handle. Frozen after startup; resources are expected to
/// be internally safe for concurrent use.
#[derive(Clone, Default)]
pub struct Resources {
    entries: HashMap<String, Capability>,
}

impl Resources {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, resource: T) {
        self.entries.insert(name.into(), Arc::new(resource));
    }

    pub fn insert_capability(&mut self, name: impl Into<String>, resource: Capability) {
        self.entries.insert(name.into(), resource);
    }

    /// Typed lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Missing`] for unknown names and
    /// [`ResolveError::TypeMismatch`] when the resource has another type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ResolveError> {
        let resource = self.entries.get(name).ok_or_else(|| ResolveError::Missing {
            name: name.to_string(),
        })?;
        Arc::clone(resource)
            .downcast::<T>()
            .map_err(|_| ResolveError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Creates every declared resource with the matching loader.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownResourceType`] for an unregistered `uses`,
    /// or the loader's failure wrapped in [`LoadError::Resource`].
    pub fn load(
        declared: &BTreeMap<String, ComponentConfig>,
        loaders: &ResourceLoaders,
        resolver: &Resolver,
    ) -> Result<Self, LoadError> {
        let mut resources = Self::new();
        for (name, component) in declared {
            let loader = loaders
                .get(&component.uses)
                .ok_or_else(|| LoadError::UnknownResourceType {
                    name: component.uses.clone(),
                })?;
            let resource = loader(&component.with, resolver).map_err(|source| LoadError::Resource {
                name: name.clone(),
                source: Box::new(source),
            })?;
            tracing::debug!(resource = %name, uses = %component.uses, "resource created");
            resources.insert_capability(name.clone(), resource);
        }
        Ok(resources)
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("Resources").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Resource loaders
// ---------------------------------------------------------------------------

pub type ResourceLoaderFn = dyn Fn(&Value, &Resolver) -> Result<Capability, LoadError> + Send + Sync;

/// Resource type name -> constructor.
#[derive(Clone, Default)]
pub struct ResourceLoaders {
    loaders: HashMap<String, Arc<ResourceLoaderFn>>,
}

impl ResourceLoaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loaders for the built-in resource types.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut loaders = Self::new();
        loaders.register(MemoryBlob::TYPE, |_, _| Ok(Arc::new(MemoryBlob::new())));
        loaders
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        loader: impl Fn(&Value, &Resolver) -> Result<Capability, LoadError> + Send + Sync + 'static,
    ) {
        self.loaders.insert(name.into(), Arc::new(loader));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ResourceLoaderFn>> {
        self.loaders.get(name)
    }
}

impl fmt::Debug for ResourceLoaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.loaders.keys().collect();
        names.sort();
        f.debug_struct("ResourceLoaders").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// MemoryBlob
// ---------------------------------------------------------------------------

/// In-process blob store keyed by object name.
#[derive(Debug, Default)]
pub struct MemoryBlob {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryBlob {
    pub const TYPE: &'static str = "memory_blob";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects.insert(key.into(), bytes);
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.remove(key).map(|(_, bytes)| bytes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_declared_memory_blob() {
        let declared: BTreeMap<String, ComponentConfig> = serde_yaml::from_str(
            "bucket:\n  uses: memory_blob\n",
        )
        .unwrap();
        let resources =
            Resources::load(&declared, &ResourceLoaders::with_defaults(), &Resolver::empty()).unwrap();
        let blob = resources.get::<MemoryBlob>("bucket").unwrap();
        blob.put("a", b"xyz".to_vec());
        assert_eq!(resources.get::<MemoryBlob>("bucket").unwrap().get("a"), Some(b"xyz".to_vec()));
        assert!(matches!(
            resources.get::<String>("bucket"),
            Err(ResolveError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unknown_resource_type_fails() {
        let declared: BTreeMap<String, ComponentConfig> =
            serde_yaml::from_str("db:\n  uses: postgres\n").unwrap();
        let err = Resources::load(&declared, &ResourceLoaders::new(), &Resolver::empty()).unwrap_err();
        assert!(matches!(err, LoadError::UnknownResourceType { name } if name == "postgres"));
    }
}
