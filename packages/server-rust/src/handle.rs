//! Late-bound references for capabilities that must be resolvable while
//! their owner is still being loaded.
//!
//! The processor and the engine are handed to loaders through the resolver
//! before their own configuration has finished loading, so loaders receive
//! a handle that is bound once loading succeeds. The handle holds a weak
//! reference to avoid an ownership cycle through the actions it reaches.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use relaybus_core::{ActionError, ErrorCode};

pub struct LateBound<T> {
    name: &'static str,
    cell: Arc<OnceLock<Weak<T>>>,
}

impl<T> LateBound<T> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// Binds the handle. Later binds are ignored.
    pub fn bind(&self, target: &Arc<T>) {
        let _ = self.cell.set(Arc::downgrade(target));
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The bound target.
    ///
    /// # Errors
    ///
    /// Returns an `unavailable` error before binding or after the target
    /// has been dropped.
    pub fn get(&self) -> Result<Arc<T>, ActionError> {
        self.cell
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                ActionError::with_code(ErrorCode::Unavailable, format!("{} is not available", self.name))
            })
    }
}

impl<T> Clone for LateBound<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for LateBound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LateBound")
            .field("name", &self.name)
            .field("bound", &self.is_bound())
            .finish()
    }
}
