use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Largest value a 48-bit Bluetooth device address can hold.
const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Stable identity of a remote peer.
///
/// Wraps the 48-bit device address. The identity outlives every connection
/// epoch and is the only piece of device state a caller is expected to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerIdentity {
    id: u64,
}

impl PeerIdentity {
    /// Build an identity from a raw 48-bit address.
    pub fn from_id(id: u64) -> Result<Self, Error> {
        if id & !ADDRESS_MASK != 0 {
            return Err(Error::InvalidAddress(format!("{:#X} exceeds 48 bits", id)));
        }
        Ok(Self { id })
    }

    /// The address expressed as an integer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The six address bytes, most significant first.
    pub fn octets(&self) -> [u8; 6] {
        let b = self.id.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for PeerIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 || parts.iter().any(|p| p.len() != 2) {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        let hex = parts.concat();
        let id =
            u64::from_str_radix(&hex, 16).map_err(|_| Error::InvalidAddress(s.to_string()))?;
        Self::from_id(id)
    }
}

impl TryFrom<String> for PeerIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerIdentity> for String {
    fn from(peer: PeerIdentity) -> Self {
        peer.to_string()
    }
}

/// Link state of a peer, as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Whether `next` is a legal edge out of this state.
    ///
    /// ```text
    /// Disconnected ──▶ Connecting ──▶ Connected ──▶ Disconnecting ──▶ Disconnected
    ///                      │  └──────────────────────────▲
    ///                      └──▶ Disconnected (attempt failed)
    /// ```
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code reported by the transport for a connect, discover or
/// attribute operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    pub const INVALID_OFFSET: Self = Self(0x07);
    /// Link supervision timeout, also used when a connect attempt never completes.
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);
    pub const INVALID_ATTRIBUTE_LENGTH: Self = Self(0x0D);
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(0x0F);
    pub const CONNECTION_CONGESTED: Self = Self(0x8F);
    pub const FAILURE: Self = Self(0x101);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", self.0)
    }
}

/// Identifies one discovered attribute (service, characteristic or
/// descriptor) within a connection epoch.
///
/// The transport assigns instance indexes; they must be unique per UUID for
/// the lifetime of one discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeHandle {
    pub uuid: Uuid,
    pub instance: u16,
}

impl AttributeHandle {
    pub fn new(uuid: Uuid, instance: u16) -> Self {
        Self { uuid, instance }
    }
}

impl fmt::Display for AttributeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uuid, self.instance)
    }
}

/// What a queued operation does against the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    /// A write to the client configuration descriptor of a characteristic.
    Subscribe,
    Discover,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Subscribe => "subscribe",
            Self::Discover => "discover",
        };
        f.write_str(name)
    }
}
