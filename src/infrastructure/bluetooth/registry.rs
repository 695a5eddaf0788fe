//! Per-epoch service registry
//!
//! Built once from a successful discovery and never mutated afterwards. A new
//! discovery or a disconnect replaces the whole registry.

use crate::domain::models::AttributeHandle;
use crate::infrastructure::bluetooth::connection::GattClient;
use crate::infrastructure::bluetooth::factory::FactoryChain;
use crate::infrastructure::bluetooth::gatt::{Characteristic, Descriptor, GattService};
use crate::infrastructure::bluetooth::transport::NativeService;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A resolved operable attribute together with the service that owns it.
#[derive(Clone)]
pub enum AttributeRef {
    Characteristic {
        service: Arc<dyn GattService>,
        characteristic: Arc<Characteristic>,
    },
    Descriptor {
        service: Arc<dyn GattService>,
        characteristic: Arc<Characteristic>,
        descriptor: Arc<Descriptor>,
    },
}

impl AttributeRef {
    pub fn handle(&self) -> AttributeHandle {
        match self {
            Self::Characteristic { characteristic, .. } => characteristic.handle(),
            Self::Descriptor { descriptor, .. } => descriptor.handle(),
        }
    }

    pub fn service(&self) -> &Arc<dyn GattService> {
        match self {
            Self::Characteristic { service, .. } | Self::Descriptor { service, .. } => service,
        }
    }

    /// The characteristic itself, or the one owning the descriptor.
    pub fn characteristic(&self) -> &Arc<Characteristic> {
        match self {
            Self::Characteristic { characteristic, .. }
            | Self::Descriptor { characteristic, .. } => characteristic,
        }
    }

    pub fn is_descriptor(&self) -> bool {
        matches!(self, Self::Descriptor { .. })
    }

    /// Update the local value cell.
    pub fn set_value(&self, value: &[u8]) {
        match self {
            Self::Characteristic { characteristic, .. } => characteristic.set_value(value),
            Self::Descriptor { descriptor, .. } => descriptor.set_value(value),
        }
    }

    pub(crate) fn run_read_hook(&self) {
        match self {
            Self::Characteristic {
                service,
                characteristic,
            } => service.on_characteristic_read(characteristic),
            Self::Descriptor {
                service,
                characteristic,
                descriptor,
            } => service.on_descriptor_read(characteristic, descriptor),
        }
    }

    pub(crate) fn run_write_hook(&self) {
        match self {
            Self::Characteristic {
                service,
                characteristic,
            } => service.on_characteristic_write(characteristic),
            Self::Descriptor {
                service,
                characteristic,
                descriptor,
            } => service.on_descriptor_write(characteristic, descriptor),
        }
    }
}

impl std::fmt::Debug for AttributeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeRef")
            .field("service", &self.service().handle())
            .field("attribute", &self.handle())
            .finish()
    }
}

pub struct ServiceRegistry {
    epoch: u64,
    services: Vec<Arc<dyn GattService>>,
    index: HashMap<AttributeHandle, AttributeRef>,
}

impl ServiceRegistry {
    pub fn empty(epoch: u64) -> Self {
        Self {
            epoch,
            services: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Wrap every discovered service and index its characteristics and
    /// descriptors. A handle reported twice keeps its first owner.
    pub fn build(
        epoch: u64,
        factories: &FactoryChain,
        client: &GattClient,
        natives: &[NativeService],
    ) -> Self {
        let mut registry = Self::empty(epoch);

        for native in natives {
            if registry.services.iter().any(|s| s.handle() == native.handle) {
                warn!("Duplicate service {} in discovery; keeping the first", native.handle);
                continue;
            }

            let service = factories.instantiate(client, native);
            for characteristic in service.core().characteristics() {
                registry.insert(AttributeRef::Characteristic {
                    service: service.clone(),
                    characteristic: characteristic.clone(),
                });
                for descriptor in characteristic.descriptors() {
                    registry.insert(AttributeRef::Descriptor {
                        service: service.clone(),
                        characteristic: characteristic.clone(),
                        descriptor: descriptor.clone(),
                    });
                }
            }
            registry.services.push(service);
        }

        debug!(
            "Registry for epoch {}: {} services, {} attributes",
            epoch,
            registry.services.len(),
            registry.index.len()
        );
        registry
    }

    fn insert(&mut self, attribute: AttributeRef) {
        let handle = attribute.handle();
        if self.index.contains_key(&handle) {
            warn!("Duplicate attribute {} in discovery; keeping the first", handle);
            return;
        }
        self.index.insert(handle, attribute);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn services(&self) -> &[Arc<dyn GattService>] {
        &self.services
    }

    /// First service with `uuid`.
    pub fn service(&self, uuid: &Uuid) -> Option<Arc<dyn GattService>> {
        self.services.iter().find(|s| s.uuid() == *uuid).cloned()
    }

    pub fn service_instance(&self, uuid: &Uuid, instance: u16) -> Option<Arc<dyn GattService>> {
        self.services
            .iter()
            .find(|s| s.uuid() == *uuid && s.instance_id() == instance)
            .cloned()
    }

    pub fn services_with_uuid(&self, uuid: &Uuid) -> Vec<Arc<dyn GattService>> {
        self.services
            .iter()
            .filter(|s| s.uuid() == *uuid)
            .cloned()
            .collect()
    }

    /// First service whose handler is a `T`.
    pub fn service_of<T: GattService>(&self) -> Option<Arc<T>> {
        self.services
            .iter()
            .find_map(|s| s.clone().as_any().downcast::<T>().ok())
    }

    pub fn resolve(&self, handle: &AttributeHandle) -> Option<AttributeRef> {
        self.index.get(handle).cloned()
    }

    pub fn characteristic(&self, handle: &AttributeHandle) -> Option<Arc<Characteristic>> {
        match self.index.get(handle)? {
            AttributeRef::Characteristic { characteristic, .. } => Some(characteristic.clone()),
            AttributeRef::Descriptor { .. } => None,
        }
    }

    /// Characteristics and descriptors addressable in this epoch.
    pub fn attribute_count(&self) -> usize {
        self.index.len()
    }
}
