//! Minimal service container for hub methods
//!
//! Services are registered on a [`ServiceCollection`], frozen into a
//! [`ServiceProvider`], and resolved through a per-dispatch [`ServiceScope`].
//! Singletons are shared by every scope; scoped services are built at most
//! once per scope.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

type AnyArc = Arc<dyn Any + Send + Sync>;
type ScopedFactory = Arc<dyn Fn(&ServiceProvider) -> AnyArc + Send + Sync>;
type ServiceId = (TypeId, Option<String>);

#[derive(Clone)]
enum Registration {
    Singleton(AnyArc),
    Scoped(ScopedFactory),
}

/// Mutable registration list.
#[derive(Default)]
pub struct ServiceCollection {
    registrations: HashMap<ServiceId, Registration>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared instance
    pub fn add_singleton<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.add_singleton_arc(Arc::new(value))
    }

    /// Register an already shared instance
    pub fn add_singleton_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.registrations
            .insert((TypeId::of::<T>(), None), Registration::Singleton(value));
        self
    }

    /// Register a shared instance under `key`
    pub fn add_keyed_singleton<T: Send + Sync + 'static>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> &mut Self {
        self.registrations.insert(
            (TypeId::of::<T>(), Some(key.into())),
            Registration::Singleton(Arc::new(value)),
        );
        self
    }

    /// Register a factory producing one instance per scope
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceProvider) -> T + Send + Sync + 'static,
    {
        let factory: ScopedFactory = Arc::new(move |provider: &ServiceProvider| -> AnyArc { Arc::new(factory(provider)) });
        self.registrations
            .insert((TypeId::of::<T>(), None), Registration::Scoped(factory));
        self
    }

    pub fn build(self) -> ServiceProvider {
        ServiceProvider {
            registrations: Arc::new(self.registrations),
        }
    }
}

/// Immutable, cheaply cloneable service registry.
#[derive(Clone, Default)]
pub struct ServiceProvider {
    registrations: Arc<HashMap<ServiceId, Registration>>,
}

impl ServiceProvider {
    /// Resolve a singleton. Scoped services need a [`ServiceScope`].
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        match self.registrations.get(&(TypeId::of::<T>(), None))? {
            Registration::Singleton(value) => value.clone().downcast::<T>().ok(),
            Registration::Scoped(_) => None,
        }
    }

    pub fn create_scope(&self) -> ServiceScope {
        ServiceScope {
            provider: self.clone(),
            instances: Mutex::new(HashMap::new()),
        }
    }
}

/// Resolution scope for one hub dispatch.
pub struct ServiceScope {
    provider: ServiceProvider,
    instances: Mutex<HashMap<ServiceId, AnyArc>>,
}

impl ServiceScope {
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve((TypeId::of::<T>(), None))
    }

    pub fn get_keyed<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.resolve((TypeId::of::<T>(), Some(key.to_string())))
    }

    pub fn provider(&self) -> &ServiceProvider {
        &self.provider
    }

    fn resolve<T: Send + Sync + 'static>(&self, id: ServiceId) -> Option<Arc<T>> {
        let value = match self.provider.registrations.get(&id)? {
            Registration::Singleton(value) => value.clone(),
            Registration::Scoped(factory) => {
                if let Some(existing) = self.cached(&id) {
                    existing
                } else {
                    // Built outside the lock so factories may resolve other services.
                    let created = factory(&self.provider);
                    self.instances
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(id)
                        .or_insert(created)
                        .clone()
                }
            }
        };
        value.downcast::<T>().ok()
    }

    fn cached(&self, id: &ServiceId) -> Option<AnyArc> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}
