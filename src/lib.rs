//! BLE GATT client session management.
//!
//! A [`BleDevice`] owns the connection to one peer: its state machine, the
//! serialized command queue for the current connection epoch, the registry of
//! discovered services and the event buses observers subscribe to. All radio
//! access goes through a [`Transport`] supplied by the embedding application.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    AttributeHandle, ConnectionState, GattStatus, OperationKind, PeerIdentity,
};
pub use domain::settings::{DispatchMode, LogSettings, SessionSettings, SettingsService};
pub use error::{Error, OperationError, RejectReason, Result, TransportError};
pub use infrastructure::bluetooth::events::{
    ConnectionEvent, DiscoveryEvent, ErrorEvent, ErrorSource, ValueEvent,
};
pub use infrastructure::bluetooth::factory::{FactoryChain, ServiceFactory, UuidServiceFactory};
pub use infrastructure::bluetooth::gatt::{
    Characteristic, Descriptor, GattService, GenericService, ServiceCore,
};
pub use infrastructure::bluetooth::observer::{Dispatcher, EventBus, Observer};
pub use infrastructure::bluetooth::queue::{OperationReceipt, OperationResult};
pub use infrastructure::bluetooth::registry::{AttributeRef, ServiceRegistry};
pub use infrastructure::bluetooth::transport::{
    CharacteristicProperties, LinkHandle, NativeCharacteristic, NativeDescriptor, NativeService,
    Transport, TransportSink,
};
pub use infrastructure::bluetooth::{BleDevice, BluetoothService, GattClient};
pub use infrastructure::logging::{init_logger, LoggingGuard};
