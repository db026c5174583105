//! Load-time named capability lookup.
//!
//! Every loader declares its collaborators by name and resolves them once
//! when the step is built. The request path never touches the resolver.
//!
//! ```
//! use std::sync::Arc;
//! use relaybus_core::resolve::{CapabilityTable, Resolver, ResolveError};
//!
//! fn wire(resolver: &Resolver) -> Result<String, ResolveError> {
//!     relaybus_core::resolve!(resolver, "app:name" => name: String);
//!     Ok(name.as_ref().clone())
//! }
//!
//! let mut table = CapabilityTable::new();
//! table.insert("app:name", String::from("bus"));
//! assert_eq!(wire(&Resolver::from_table(table)).unwrap(), "bus");
//! ```

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opaque capability handle stored under a name.
pub type Capability = Arc<dyn Any + Send + Sync>;

/// Failure to produce a named capability for a requested slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("could not resolve {name:?}: not found")]
    Missing { name: String },
    #[error("could not resolve {name:?}: registered value is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

impl ResolveError {
    /// Name of the capability that could not be produced.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Missing { name } | Self::TypeMismatch { name, .. } => name,
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityTable
// ---------------------------------------------------------------------------

/// Plain name to value table, lifted into a [`Resolver`] by
/// [`Resolver::from_table`].
#[derive(Default, Clone)]
pub struct CapabilityTable {
    entries: HashMap<String, Capability>,
}

impl CapabilityTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous entry.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.entries.insert(name.into(), Arc::new(value));
    }

    /// Stores an already shared value so the table and its owner see the
    /// same instance.
    pub fn insert_arc<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: Arc<T>) {
        self.entries.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Capability> {
        self.entries.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("CapabilityTable").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

type LookupFn = dyn Fn(&str) -> Option<Capability> + Send + Sync;

/// A single lookup function `name -> Option<capability>` with typed access.
#[derive(Clone)]
pub struct Resolver {
    lookup: Arc<LookupFn>,
}

impl Resolver {
    /// Wraps an arbitrary lookup function.
    pub fn new(lookup: impl Fn(&str) -> Option<Capability> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    /// Lifts a plain table into a resolver.
    #[must_use]
    pub fn from_table(table: CapabilityTable) -> Self {
        let table = Arc::new(table);
        Self::new(move |name| table.get(name))
    }

    /// A resolver that produces nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(|_| None)
    }

    /// Returns a resolver that answers `name` with `capability` and defers
    /// everything else to `self`.
    #[must_use]
    pub fn overlay(&self, name: impl Into<String>, capability: Capability) -> Self {
        let name = name.into();
        let parent = Arc::clone(&self.lookup);
        Self::new(move |n| {
            if n == name {
                Some(Arc::clone(&capability))
            } else {
                parent(n)
            }
        })
    }

    /// Returns a resolver that consults `table` first, then `self`.
    #[must_use]
    pub fn overlay_table(&self, table: CapabilityTable) -> Self {
        let parent = Arc::clone(&self.lookup);
        Self::new(move |n| table.get(n).or_else(|| parent(n)))
    }

    /// Raw untyped lookup.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Capability> {
        (self.lookup)(name)
    }

    /// Resolves `name` into a handle of type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Missing`] if nothing is registered under
    /// `name`, or [`ResolveError::TypeMismatch`] if the registered value is
    /// of a different type.
    pub fn resolve<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ResolveError> {
        self.resolve_optional(name)?
            .ok_or_else(|| ResolveError::Missing {
                name: name.to_string(),
            })
    }

    /// Like [`Resolver::resolve`] but an absent name is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::TypeMismatch`] if a value exists under `name`
    /// but is not a `T`.
    pub fn resolve_optional<T: Any + Send + Sync>(
        &self,
        name: &str,
    ) -> Result<Option<Arc<T>>, ResolveError> {
        match self.lookup(name) {
            None => Ok(None),
            Some(cap) => cap
                .downcast::<T>()
                .map(Some)
                .map_err(|_| ResolveError::TypeMismatch {
                    name: name.to_string(),
                    expected: type_name::<T>(),
                }),
        }
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

/// Resolves several named capabilities left to right, binding each to a
/// local and returning early (via `?`) at the first failure.
///
/// The enclosing function's error type must implement
/// `From<ResolveError>`.
#[macro_export]
macro_rules! resolve {
    ($resolver:expr, $($name:expr => $slot:ident : $ty:ty),+ $(,)?) => {
        $(
            let $slot: ::std::sync::Arc<$ty> = $resolver.resolve::<$ty>($name)?;
        )+
    };
}
