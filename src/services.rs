//! Host capability lookup shared by every loaded module.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Lookup-by-capability interface handed to the registry at construction.
///
/// Handles are read-shared by all modules; the core never constructs them.
pub trait CapabilityProvider: Send + Sync {
    fn lookup(&self, capability: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Typed lookup on top of [`CapabilityProvider::lookup`].
pub fn lookup<T>(provider: &dyn CapabilityProvider) -> Option<Arc<T>>
where
    T: Any + Send + Sync,
{
    provider
        .lookup(TypeId::of::<T>())
        .and_then(|handle| handle.downcast::<T>().ok())
}

/// Simple type-keyed service map.
#[derive(Default, Clone)]
pub struct ServiceCollection {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared handle, replacing any previous one of the same type.
    pub fn insert<T>(&mut self, service: Arc<T>) -> &mut Self
    where
        T: Any + Send + Sync,
    {
        self.services.insert(TypeId::of::<T>(), service);
        self
    }

    #[must_use]
    pub fn with<T>(mut self, service: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        self.insert(service);
        self
    }

    #[must_use]
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        lookup(self)
    }

    #[must_use]
    pub fn contains<T: Any>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl CapabilityProvider for ServiceCollection {
    fn lookup(&self, capability: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(&capability).map(Arc::clone)
    }
}

impl std::fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCollection")
            .field("services", &self.services.len())
            .finish()
    }
}
