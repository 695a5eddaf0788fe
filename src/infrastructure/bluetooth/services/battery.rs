//! Battery Service (0x180F)

use crate::error::OperationError;
use crate::infrastructure::bluetooth::connection::GattClient;
use crate::infrastructure::bluetooth::gatt::{Characteristic, Descriptor, GattService, ServiceCore};
use crate::infrastructure::bluetooth::observer::{EventBus, Observer};
use crate::infrastructure::bluetooth::protocol::{
    read_u8, uuid_from_u16, CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::queue::OperationReceipt;
use crate::infrastructure::bluetooth::transport::NativeService;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct BatteryService {
    core: ServiceCore,
    level_characteristic: Option<Arc<Characteristic>>,
    level: AtomicI32,
    notifying: AtomicBool,
    level_events: EventBus<i32>,
}

impl BatteryService {
    pub const UUID: Uuid = uuid_from_u16(0x180F);
    pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);

    /// No reading yet.
    pub const LEVEL_UNKNOWN: i32 = -1;
    /// The peer exposes no battery level characteristic.
    pub const LEVEL_UNAVAILABLE: i32 = -2;

    pub fn new(client: &GattClient, native: &NativeService) -> Self {
        let core = ServiceCore::new(client, native);
        let level_characteristic = core.characteristic(&Self::BATTERY_LEVEL).cloned();
        if level_characteristic.is_none() {
            warn!("Battery service {} has no level characteristic", core.handle());
        }
        Self {
            core,
            level_characteristic,
            level: AtomicI32::new(Self::LEVEL_UNKNOWN),
            notifying: AtomicBool::new(false),
            level_events: EventBus::new(),
        }
    }

    /// Last known level in percent.
    ///
    /// Returns [`Self::LEVEL_UNKNOWN`] and starts a read when nothing has been
    /// received yet; observers hear about the result.
    pub fn battery_level(&self) -> i32 {
        let Some(characteristic) = &self.level_characteristic else {
            return Self::LEVEL_UNAVAILABLE;
        };
        let level = self.level.load(Ordering::Acquire);
        if level == Self::LEVEL_UNKNOWN {
            let _pending = self.core.read(characteristic);
        }
        level
    }

    /// Read the level from the peer and wait for it.
    pub async fn refresh(&self) -> Result<i32, OperationError> {
        let Some(characteristic) = &self.level_characteristic else {
            return Ok(Self::LEVEL_UNAVAILABLE);
        };
        self.core.read(characteristic).await?;
        Ok(self.level.load(Ordering::Acquire))
    }

    /// Receive every level change.
    ///
    /// Turns notifications on unless the peer already confirmed them, so an
    /// observer arriving after a failed attempt retries it.
    pub fn observe_level<O>(&self, observer: &Arc<O>) -> OperationReceipt
    where
        O: Observer<i32> + 'static,
    {
        self.level_events.register(observer);
        if self.notifying.load(Ordering::Acquire) {
            return OperationReceipt::ready(Ok(Vec::new()));
        }
        self.set_notifications(true)
    }

    /// The last observer leaving turns notifications off.
    pub fn unobserve_level<O>(&self, observer: &Arc<O>) -> OperationReceipt
    where
        O: Observer<i32> + 'static,
    {
        if !self.level_events.unregister(observer) || !self.level_events.is_empty() {
            return OperationReceipt::ready(Ok(Vec::new()));
        }
        self.set_notifications(false)
    }

    /// True once the peer accepted a request to send level notifications.
    pub fn is_notifying(&self) -> bool {
        self.notifying.load(Ordering::Acquire)
    }

    fn set_notifications(&self, enabled: bool) -> OperationReceipt {
        match &self.level_characteristic {
            Some(characteristic) => self.core.set_notification(characteristic, enabled),
            None => OperationReceipt::ready(Ok(Vec::new())),
        }
    }

    fn update_level(&self, characteristic: &Characteristic) {
        if characteristic.uuid() != Self::BATTERY_LEVEL {
            return;
        }
        let Some(raw) = read_u8(&characteristic.value(), 0) else {
            warn!("Empty battery level from {}", self.core.handle());
            return;
        };
        let level = i32::from(raw);
        let previous = self.level.swap(level, Ordering::AcqRel);
        if previous != level {
            debug!("Battery level {}%", level);
            self.level_events.notify(level);
        }
    }
}

impl GattService for BatteryService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_characteristic_read(&self, characteristic: &Characteristic) {
        self.update_level(characteristic);
    }

    fn on_characteristic_changed(&self, characteristic: &Characteristic) {
        self.update_level(characteristic);
    }

    fn on_descriptor_write(&self, characteristic: &Characteristic, descriptor: &Descriptor) {
        if characteristic.uuid() != Self::BATTERY_LEVEL
            || descriptor.uuid() != CLIENT_CHARACTERISTIC_CONFIG
        {
            return;
        }
        let enabled = descriptor.value() != DISABLE_NOTIFICATION_VALUE;
        debug!(
            "Battery level notifications {}",
            if enabled { "on" } else { "off" }
        );
        self.notifying.store(enabled, Ordering::Release);
    }
}
