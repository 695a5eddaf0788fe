//! Events published by a [`BleDevice`](crate::infrastructure::bluetooth::connection::BleDevice)

use crate::domain::models::{AttributeHandle, ConnectionState, OperationKind, PeerIdentity};
use crate::error::OperationError;
use crate::infrastructure::bluetooth::gatt::GattService;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        peer: PeerIdentity,
        state: ConnectionState,
    },
    AvailabilityChanged {
        peer: PeerIdentity,
        available: bool,
    },
}

impl ConnectionEvent {
    pub fn peer(&self) -> PeerIdentity {
        match self {
            Self::StateChanged { peer, .. } | Self::AvailabilityChanged { peer, .. } => *peer,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// One typed service was registered for `epoch`.
    ServiceDiscovered {
        peer: PeerIdentity,
        epoch: u64,
        service: Arc<dyn GattService>,
    },
    /// The registry for `epoch` is complete.
    Completed {
        peer: PeerIdentity,
        epoch: u64,
        services: usize,
    },
}

/// Where a reported error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Connection,
    Discovery,
    Operation {
        kind: OperationKind,
        attribute: AttributeHandle,
    },
    /// A service hook failed while handling a pushed value.
    Notification {
        attribute: AttributeHandle,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub peer: PeerIdentity,
    pub source: ErrorSource,
    pub error: OperationError,
}

/// A notification or indication received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEvent {
    pub peer: PeerIdentity,
    pub attribute: AttributeHandle,
    pub value: Vec<u8>,
}
