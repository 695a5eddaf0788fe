//! Transport boundary
//!
//! The session never touches a radio. Everything it needs from the platform
//! goes through [`Transport`], and everything the platform reports back comes
//! in through a [`TransportSink`].
//!
//! Calls on [`Transport`] only *initiate* work; results arrive later on the
//! sink. Implementations must not invoke sink methods synchronously from inside
//! a [`Transport`] call. Sink methods may be called from any thread.

use crate::domain::models::{AttributeHandle, ConnectionState, GattStatus, PeerIdentity};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::connection::DeviceInner;
use std::fmt;
use std::sync::Weak;
use uuid::Uuid;

/// Opaque native link handle issued by [`Transport::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Characteristic property bits as advertised during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_subscribe(&self) -> bool {
        self.0 & (Self::NOTIFY.0 | Self::INDICATE.0) != 0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDescriptor {
    pub handle: AttributeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCharacteristic {
    pub handle: AttributeHandle,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<NativeDescriptor>,
}

/// One service as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeService {
    pub handle: AttributeHandle,
    pub characteristics: Vec<NativeCharacteristic>,
}

impl NativeService {
    pub fn uuid(&self) -> Uuid {
        self.handle.uuid
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&NativeCharacteristic> {
        self.characteristics.iter().find(|c| c.handle.uuid == *uuid)
    }
}

/// Platform GATT client operations.
pub trait Transport: Send + Sync + 'static {
    /// Begin connecting to `peer`. The outcome is reported through
    /// [`TransportSink::connection_state_changed`].
    fn connect(&self, peer: PeerIdentity, sink: TransportSink)
        -> Result<LinkHandle, TransportError>;

    /// Connect again over a handle that has not been closed yet.
    ///
    /// Transports that cannot reuse a handle may keep the default, which
    /// releases the old one and starts a fresh connect.
    fn reconnect(
        &self,
        peer: PeerIdentity,
        link: LinkHandle,
        sink: TransportSink,
    ) -> Result<LinkHandle, TransportError> {
        self.close(link);
        self.connect(peer, sink)
    }

    fn disconnect(&self, link: LinkHandle) -> Result<(), TransportError>;

    /// Release the native handle. Must tolerate being called more than once.
    fn close(&self, link: LinkHandle);

    fn discover_attributes(&self, link: LinkHandle) -> Result<(), TransportError>;

    fn read_attribute(&self, link: LinkHandle, attr: AttributeHandle)
        -> Result<(), TransportError>;

    fn write_attribute(
        &self,
        link: LinkHandle,
        attr: AttributeHandle,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Route local notifications for `attr` to the sink. This does not talk to
    /// the peer; the configuration descriptor write does.
    fn set_notify(
        &self,
        link: LinkHandle,
        attr: AttributeHandle,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Whether `peer` is currently reachable.
    fn is_available(&self, peer: PeerIdentity) -> bool;

    /// Authoritative link state, when the platform can report it.
    fn connection_state(&self, _link: LinkHandle) -> Option<ConnectionState> {
        None
    }

    fn peer_name(&self, _peer: PeerIdentity) -> Option<String> {
        None
    }
}

/// Callback surface handed to [`Transport::connect`].
///
/// A sink is bound to one connect attempt. Once the device has moved on to a
/// newer attempt, calls through an old sink are ignored.
#[derive(Clone)]
pub struct TransportSink {
    pub(crate) device: Weak<DeviceInner>,
    pub(crate) attempt: u64,
}

impl TransportSink {
    pub fn connection_state_changed(&self, status: GattStatus, state: ConnectionState) {
        if let Some(device) = self.device.upgrade() {
            device.on_connection_state_changed(self.attempt, status, state);
        }
    }

    pub fn discovery_complete(&self, status: GattStatus, services: Vec<NativeService>) {
        if let Some(device) = self.device.upgrade() {
            device.on_discovery_complete(self.attempt, status, services);
        }
    }

    pub fn operation_complete(&self, attr: AttributeHandle, status: GattStatus, value: Vec<u8>) {
        if let Some(device) = self.device.upgrade() {
            device.on_operation_complete(self.attempt, attr, status, value);
        }
    }

    pub fn value_changed(&self, attr: AttributeHandle, value: Vec<u8>) {
        if let Some(device) = self.device.upgrade() {
            device.on_value_changed(self.attempt, attr, value);
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink")
            .field("attempt", &self.attempt)
            .field("alive", &(self.device.strong_count() > 0))
            .finish()
    }
}
