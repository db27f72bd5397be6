//! Hub instance activation
//!
//! A hub instance lives for one top-level dispatch: `on_connected`,
//! `on_disconnected`, or a single invocation. [`HubHandle`] releases the
//! instance through its activator when dropped, including on early returns
//! and panics unwinding through the dispatcher.

use crate::hub::method::{Hub, HubError, HubResult};
use crate::hub::services::ServiceScope;
use std::sync::Arc;

/// An activated hub and whether the activator owns its lifetime.
pub struct Activated<H> {
    pub hub: Arc<H>,
    /// `false` when the hub came from the service scope and must not be disposed
    pub owned: bool,
}

/// Creates and releases hub instances.
pub trait HubActivator<H: Hub>: Send + Sync + 'static {
    fn create(&self, scope: &ServiceScope) -> HubResult<Activated<H>>;

    fn release(&self, activated: Activated<H>);
}

type HubFactory<H> = Arc<dyn Fn(&ServiceScope) -> H + Send + Sync>;

/// Default activator: a hub registered in the service scope is used as is,
/// otherwise the factory builds a fresh instance that is disposed on release.
pub struct DefaultHubActivator<H> {
    factory: Option<HubFactory<H>>,
}

impl<H: Hub> DefaultHubActivator<H> {
    /// Resolve hubs from services only
    pub fn from_services() -> Self {
        Self { factory: None }
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&ServiceScope) -> H + Send + Sync + 'static,
    {
        Self {
            factory: Some(Arc::new(factory)),
        }
    }
}

impl<H: Hub> HubActivator<H> for DefaultHubActivator<H> {
    fn create(&self, scope: &ServiceScope) -> HubResult<Activated<H>> {
        if let Some(hub) = scope.get::<H>() {
            return Ok(Activated { hub, owned: false });
        }
        match &self.factory {
            Some(factory) => Ok(Activated {
                hub: Arc::new(factory(scope)),
                owned: true,
            }),
            None => Err(HubError::internal(format!(
                "Unable to activate hub '{}': no factory or service registered.",
                std::any::type_name::<H>()
            ))),
        }
    }

    fn release(&self, activated: Activated<H>) {
        if activated.owned {
            activated.hub.dispose();
        }
    }
}

/// Scoped hub instance, released on drop.
pub struct HubHandle<H: Hub> {
    activator: Arc<dyn HubActivator<H>>,
    hub: Arc<H>,
    activated: Option<Activated<H>>,
}

impl<H: Hub> HubHandle<H> {
    pub fn activate(activator: Arc<dyn HubActivator<H>>, scope: &ServiceScope) -> HubResult<Self> {
        let activated = activator.create(scope)?;
        Ok(Self {
            activator,
            hub: activated.hub.clone(),
            activated: Some(activated),
        })
    }

    /// Shared reference to the hub instance
    pub fn hub(&self) -> Arc<H> {
        self.hub.clone()
    }
}

impl<H: Hub> Drop for HubHandle<H> {
    fn drop(&mut self) {
        if let Some(activated) = self.activated.take() {
            self.activator.release(activated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::services::ServiceCollection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHub {
        disposed: Arc<AtomicUsize>,
    }

    impl Hub for CountingHub {
        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_factory_hub_disposed_on_drop() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = disposed.clone();
        let activator: Arc<dyn HubActivator<CountingHub>> =
            Arc::new(DefaultHubActivator::with_factory(move |_| CountingHub {
                disposed: counter.clone(),
            }));
        let scope = ServiceCollection::new().build().create_scope();

        {
            let handle = HubHandle::activate(activator.clone(), &scope).unwrap();
            let _hub = handle.hub();
            assert_eq!(disposed.load(Ordering::SeqCst), 0);
        }
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_hub_not_disposed() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let mut services = ServiceCollection::new();
        services.add_singleton(CountingHub {
            disposed: disposed.clone(),
        });
        let scope = services.build().create_scope();
        let activator: Arc<dyn HubActivator<CountingHub>> =
            Arc::new(DefaultHubActivator::<CountingHub>::from_services());

        drop(HubHandle::activate(activator, &scope).unwrap());
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_factory_is_an_error() {
        let scope = ServiceCollection::new().build().create_scope();
        let activator: Arc<dyn HubActivator<CountingHub>> =
            Arc::new(DefaultHubActivator::<CountingHub>::from_services());
        assert!(HubHandle::activate(activator, &scope).is_err());
    }
}
