//! Typed GATT services
//!
//! A [`GattService`] wraps one discovered native service. The session calls its
//! hooks after a queued read or write completes and whenever the peer pushes a
//! new value. Hooks run on the queue worker (reads and writes) or on the
//! transport callback context (notifications); they must not block.

use crate::domain::models::AttributeHandle;
use crate::infrastructure::bluetooth::connection::GattClient;
use crate::infrastructure::bluetooth::protocol::{self, CLIENT_CHARACTERISTIC_CONFIG};
use crate::infrastructure::bluetooth::queue::OperationReceipt;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicProperties, NativeCharacteristic, NativeDescriptor, NativeService,
};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Client-side view of a remote descriptor.
#[derive(Debug)]
pub struct Descriptor {
    handle: AttributeHandle,
    value: RwLock<Vec<u8>>,
}

impl Descriptor {
    pub fn from_native(native: &NativeDescriptor) -> Self {
        Self {
            handle: native.handle,
            value: RwLock::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub fn uuid(&self) -> Uuid {
        self.handle.uuid
    }

    /// Last value read from, written to, or queued for the peer.
    pub fn value(&self) -> Vec<u8> {
        self.value.read().clone()
    }

    pub fn set_value(&self, value: &[u8]) {
        *self.value.write() = value.to_vec();
    }
}

/// Client-side view of a remote characteristic and its cached value.
pub struct Characteristic {
    handle: AttributeHandle,
    properties: CharacteristicProperties,
    value: RwLock<Vec<u8>>,
    descriptors: Vec<Arc<Descriptor>>,
}

impl Characteristic {
    pub fn from_native(native: &NativeCharacteristic) -> Self {
        Self {
            handle: native.handle,
            properties: native.properties,
            value: RwLock::new(Vec::new()),
            descriptors: native
                .descriptors
                .iter()
                .map(|d| Arc::new(Descriptor::from_native(d)))
                .collect(),
        }
    }

    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub fn uuid(&self) -> Uuid {
        self.handle.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    pub fn value(&self) -> Vec<u8> {
        self.value.read().clone()
    }

    pub fn set_value(&self, value: &[u8]) {
        *self.value.write() = value.to_vec();
    }

    /// Unsigned 8-bit value at `offset` of the cached value.
    pub fn u8_value(&self, offset: usize) -> Option<u8> {
        protocol::read_u8(&self.value.read(), offset)
    }

    pub fn u16_value(&self, offset: usize) -> Option<u16> {
        protocol::read_u16_le(&self.value.read(), offset)
    }

    pub fn string_value(&self, offset: usize) -> Option<String> {
        protocol::read_string(&self.value.read(), offset)
    }

    pub fn descriptors(&self) -> &[Arc<Descriptor>] {
        &self.descriptors
    }

    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Arc<Descriptor>> {
        self.descriptors.iter().find(|d| d.uuid() == *uuid)
    }

    /// The client characteristic configuration descriptor, if present.
    pub fn config_descriptor(&self) -> Option<&Arc<Descriptor>> {
        self.descriptor(&CLIENT_CHARACTERISTIC_CONFIG)
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("handle", &self.handle)
            .field("properties", &self.properties)
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}

/// State every service shares: its handle, its characteristics and a client
/// for issuing queued operations.
pub struct ServiceCore {
    handle: AttributeHandle,
    characteristics: Vec<Arc<Characteristic>>,
    client: GattClient,
}

impl ServiceCore {
    pub fn new(client: &GattClient, native: &NativeService) -> Self {
        Self {
            handle: native.handle,
            characteristics: native
                .characteristics
                .iter()
                .map(|c| Arc::new(Characteristic::from_native(c)))
                .collect(),
            client: client.clone(),
        }
    }

    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub fn characteristics(&self) -> &[Arc<Characteristic>] {
        &self.characteristics
    }

    /// First characteristic with `uuid`.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Arc<Characteristic>> {
        self.characteristics.iter().find(|c| c.uuid() == *uuid)
    }

    pub fn client(&self) -> &GattClient {
        &self.client
    }

    pub fn read(&self, characteristic: &Characteristic) -> OperationReceipt {
        self.client.read(&characteristic.handle())
    }

    pub fn write(&self, characteristic: &Characteristic, value: &[u8]) -> OperationReceipt {
        self.client.write(&characteristic.handle(), value)
    }

    pub fn set_notification(
        &self,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> OperationReceipt {
        self.client
            .set_notification(&characteristic.handle(), enabled)
    }
}

pub trait GattService: Any + Send + Sync {
    fn core(&self) -> &ServiceCore;

    /// Upcast used by typed lookups; implementations return `self`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn handle(&self) -> AttributeHandle {
        self.core().handle()
    }

    fn uuid(&self) -> Uuid {
        self.core().handle().uuid
    }

    /// Distinguishes services that share a UUID on the same peer.
    fn instance_id(&self) -> u16 {
        self.core().handle().instance
    }

    fn characteristic(&self, uuid: &Uuid) -> Option<Arc<Characteristic>> {
        self.core().characteristic(uuid).cloned()
    }

    fn on_characteristic_read(&self, _characteristic: &Characteristic) {}

    fn on_characteristic_write(&self, _characteristic: &Characteristic) {}

    fn on_characteristic_changed(&self, _characteristic: &Characteristic) {}

    fn on_descriptor_read(&self, _characteristic: &Characteristic, _descriptor: &Descriptor) {}

    fn on_descriptor_write(&self, _characteristic: &Characteristic, _descriptor: &Descriptor) {}
}

impl fmt::Debug for dyn GattService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattService")
            .field("handle", &self.handle())
            .field("characteristics", &self.core().characteristics().len())
            .finish()
    }
}

/// Pass-through handler used when no factory claims a service.
pub struct GenericService {
    core: ServiceCore,
}

impl GenericService {
    pub fn new(client: &GattClient, native: &NativeService) -> Self {
        Self {
            core: ServiceCore::new(client, native),
        }
    }
}

impl GattService for GenericService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
