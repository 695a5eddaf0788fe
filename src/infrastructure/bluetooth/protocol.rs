//! GATT protocol constants
//!
//! Assigned-number helpers, the client configuration descriptor values and the
//! small set of value decoders the typed services need.

use crate::error::{Error, Result};
use uuid::Uuid;

/// The Bluetooth base UUID, `0000xxxx-0000-1000-8000-00805f9b34fb`.
pub const BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// The 16-bit assigned number of `uuid`, if it sits on the base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xFFFF_u128 << 96);
    if value & mask == BASE_UUID.as_u128() {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Client Characteristic Configuration Descriptor
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid_from_u16(0x2902);

/// CCCD payload enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD payload enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCCD payload disabling both
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Parse a UUID string, accepting either the full form or a 16-bit
/// assigned number such as `"180f"` or `"0x2A19"`.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let trimmed = uuid_str.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if hex.len() <= 4 && !hex.is_empty() {
        let short =
            u16::from_str_radix(hex, 16).map_err(|_| Error::InvalidUuid(uuid_str.to_string()))?;
        return Ok(uuid_from_u16(short));
    }

    Uuid::parse_str(trimmed).map_err(|_| Error::InvalidUuid(uuid_str.to_string()))
}

/// Read an unsigned 8-bit value at `offset`.
pub fn read_u8(bytes: &[u8], offset: usize) -> Option<u8> {
    bytes.get(offset).copied()
}

/// Read a little-endian unsigned 16-bit value at `offset`.
pub fn read_u16_le(bytes: &[u8], offset: usize) -> Option<u16> {
    let slice = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([slice[0], slice[1]]))
}

/// Decode a UTF-8 string characteristic starting at `offset`.
///
/// Trailing NUL padding is dropped; invalid sequences are replaced.
pub fn read_string(bytes: &[u8], offset: usize) -> Option<String> {
    let slice = bytes.get(offset..)?;
    let end = slice
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    Some(String::from_utf8_lossy(&slice[..end]).into_owned())
}
