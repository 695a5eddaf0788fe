//! Service factory chain
//!
//! Discovery hands every native service to a [`FactoryChain`]. Factories are
//! asked in registration order and the first one that returns a handler wins;
//! services nobody claims are wrapped in a [`GenericService`].

use crate::infrastructure::bluetooth::connection::GattClient;
use crate::infrastructure::bluetooth::gatt::{GattService, GenericService};
use crate::infrastructure::bluetooth::services::{BatteryService, DeviceInformationService};
use crate::infrastructure::bluetooth::transport::NativeService;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

pub trait ServiceFactory: Send + Sync {
    /// Build a handler for `native`, or `None` to let the next factory try.
    fn create(&self, client: &GattClient, native: &NativeService) -> Option<Arc<dyn GattService>>;
}

impl<F> ServiceFactory for F
where
    F: Fn(&GattClient, &NativeService) -> Option<Arc<dyn GattService>> + Send + Sync,
{
    fn create(&self, client: &GattClient, native: &NativeService) -> Option<Arc<dyn GattService>> {
        self(client, native)
    }
}

pub type ServiceConstructor = fn(&GattClient, &NativeService) -> Arc<dyn GattService>;

/// Maps service UUIDs to constructors registered at compile time.
#[derive(Default, Clone)]
pub struct UuidServiceFactory {
    constructors: HashMap<Uuid, ServiceConstructor>,
}

impl UuidServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard services this crate ships handlers for.
    pub fn standard() -> Self {
        Self::new()
            .with(BatteryService::UUID, |client, native| {
                Arc::new(BatteryService::new(client, native)) as Arc<dyn GattService>
            })
            .with(DeviceInformationService::UUID, |client, native| {
                Arc::new(DeviceInformationService::new(client, native)) as Arc<dyn GattService>
            })
    }

    pub fn with(mut self, uuid: Uuid, constructor: ServiceConstructor) -> Self {
        self.register(uuid, constructor);
        self
    }

    /// Returns the constructor previously registered for `uuid`, if any.
    pub fn register(&mut self, uuid: Uuid, constructor: ServiceConstructor) -> Option<ServiceConstructor> {
        self.constructors.insert(uuid, constructor)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.constructors.contains_key(uuid)
    }
}

impl ServiceFactory for UuidServiceFactory {
    fn create(&self, client: &GattClient, native: &NativeService) -> Option<Arc<dyn GattService>> {
        self.constructors
            .get(&native.uuid())
            .map(|constructor| constructor(client, native))
    }
}

#[derive(Clone, Default)]
pub struct FactoryChain {
    factories: Vec<Arc<dyn ServiceFactory>>,
}

impl FactoryChain {
    /// A chain with no factories; every service becomes a [`GenericService`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        Self::new().with(UuidServiceFactory::standard())
    }

    pub fn with(mut self, factory: impl ServiceFactory + 'static) -> Self {
        self.push(factory);
        self
    }

    pub fn push(&mut self, factory: impl ServiceFactory + 'static) {
        self.factories.push(Arc::new(factory));
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Wrap `native` with the first factory that accepts it.
    ///
    /// A factory that panics is skipped.
    pub fn instantiate(&self, client: &GattClient, native: &NativeService) -> Arc<dyn GattService> {
        for (i, factory) in self.factories.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| factory.create(client, native))) {
                Ok(Some(service)) => {
                    debug!("Factory #{} created handler for {}", i, native.handle);
                    return service;
                }
                Ok(None) => {}
                Err(_) => error!("Factory #{} panicked on {}; skipping", i, native.handle),
            }
        }
        Arc::new(GenericService::new(client, native))
    }
}
