//! Device Information Service (0x180A)

use crate::infrastructure::bluetooth::connection::GattClient;
use crate::infrastructure::bluetooth::gatt::{Characteristic, GattService, ServiceCore};
use crate::infrastructure::bluetooth::observer::EventBus;
use crate::infrastructure::bluetooth::protocol::uuid_from_u16;
use crate::infrastructure::bluetooth::transport::NativeService;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInformationEvent {
    SystemId(Vec<u8>),
    SerialNumber(String),
    FirmwareRevision(String),
    ManufacturerName(String),
}

#[derive(Default)]
struct Cache {
    system_id: Option<Vec<u8>>,
    serial_number: Option<String>,
    firmware_revision: Option<String>,
    manufacturer_name: Option<String>,
}

pub struct DeviceInformationService {
    core: ServiceCore,
    cache: RwLock<Cache>,
    events: EventBus<DeviceInformationEvent>,
}

impl DeviceInformationService {
    pub const UUID: Uuid = uuid_from_u16(0x180A);
    pub const SYSTEM_ID: Uuid = uuid_from_u16(0x2A23);
    pub const SERIAL_NUMBER: Uuid = uuid_from_u16(0x2A25);
    pub const FIRMWARE_REVISION: Uuid = uuid_from_u16(0x2A26);
    pub const MANUFACTURER_NAME: Uuid = uuid_from_u16(0x2A29);

    pub fn new(client: &GattClient, native: &NativeService) -> Self {
        Self {
            core: ServiceCore::new(client, native),
            cache: RwLock::new(Cache::default()),
            events: EventBus::new(),
        }
    }

    /// Fires whenever a field is read from the peer.
    pub fn events(&self) -> &EventBus<DeviceInformationEvent> {
        &self.events
    }

    // Getters return the cached value and start a read on a miss.

    pub fn system_id(&self) -> Option<Vec<u8>> {
        let cached = self.cache.read().system_id.clone();
        cached.or_else(|| self.request(&Self::SYSTEM_ID))
    }

    pub fn serial_number(&self) -> Option<String> {
        let cached = self.cache.read().serial_number.clone();
        cached.or_else(|| self.request(&Self::SERIAL_NUMBER))
    }

    pub fn firmware_revision(&self) -> Option<String> {
        let cached = self.cache.read().firmware_revision.clone();
        cached.or_else(|| self.request(&Self::FIRMWARE_REVISION))
    }

    pub fn manufacturer_name(&self) -> Option<String> {
        let cached = self.cache.read().manufacturer_name.clone();
        cached.or_else(|| self.request(&Self::MANUFACTURER_NAME))
    }

    fn request<T>(&self, uuid: &Uuid) -> Option<T> {
        if let Some(characteristic) = self.core.characteristic(uuid) {
            let _pending = self.core.read(characteristic);
        }
        None
    }
}

impl GattService for DeviceInformationService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_characteristic_read(&self, characteristic: &Characteristic) {
        let uuid = characteristic.uuid();
        let text = || characteristic.string_value(0).unwrap_or_default();
        let event = {
            let mut cache = self.cache.write();
            if uuid == Self::SYSTEM_ID {
                let value = characteristic.value();
                cache.system_id = Some(value.clone());
                DeviceInformationEvent::SystemId(value)
            } else if uuid == Self::SERIAL_NUMBER {
                cache.serial_number = Some(text());
                DeviceInformationEvent::SerialNumber(text())
            } else if uuid == Self::FIRMWARE_REVISION {
                cache.firmware_revision = Some(text());
                DeviceInformationEvent::FirmwareRevision(text())
            } else if uuid == Self::MANUFACTURER_NAME {
                cache.manufacturer_name = Some(text());
                DeviceInformationEvent::ManufacturerName(text())
            } else {
                return;
            }
        };
        debug!("Device information: {:?}", event);
        self.events.notify(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AttributeHandle;
    use crate::infrastructure::bluetooth::transport::{
        CharacteristicProperties, NativeCharacteristic,
    };
    use parking_lot::Mutex;

    fn service() -> DeviceInformationService {
        let characteristics = [
            DeviceInformationService::SYSTEM_ID,
            DeviceInformationService::SERIAL_NUMBER,
            DeviceInformationService::MANUFACTURER_NAME,
        ]
        .iter()
        .enumerate()
        .map(|(i, uuid)| NativeCharacteristic {
            handle: AttributeHandle::new(*uuid, i as u16),
            properties: CharacteristicProperties::READ,
            descriptors: vec![],
        })
        .collect();
        DeviceInformationService::new(
            &GattClient::detached(),
            &NativeService {
                handle: AttributeHandle::new(DeviceInformationService::UUID, 0),
                characteristics,
            },
        )
    }

    #[tokio::test]
    async fn caches_decoded_fields() {
        let service = service();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = Arc::new(move |e: &DeviceInformationEvent| sink.lock().push(e.clone()));
        service.events().register(&observer);

        assert_eq!(service.manufacturer_name(), None);

        let name = service
            .characteristic(&DeviceInformationService::MANUFACTURER_NAME)
            .unwrap();
        name.set_value(b"Acme\0\0");
        service.on_characteristic_read(&name);

        assert_eq!(service.manufacturer_name().as_deref(), Some("Acme"));
        assert_eq!(
            *seen.lock(),
            vec![DeviceInformationEvent::ManufacturerName("Acme".into())]
        );
        // not exposed by this peer
        assert_eq!(service.firmware_revision(), None);
    }

    #[tokio::test]
    async fn system_id_is_kept_raw() {
        let service = service();
        let id = service
            .characteristic(&DeviceInformationService::SYSTEM_ID)
            .unwrap();
        id.set_value(&[1, 2, 3, 4, 5, 6, 7, 8]);
        service.on_characteristic_read(&id);
        assert_eq!(service.system_id(), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
    }
}
