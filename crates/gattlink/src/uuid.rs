use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth attribute UUID.
///
/// Stored as the full 128-bit value in little-endian byte order, which is the
/// order the radio uses on the wire. 16-bit SIG-assigned values are expanded
/// over the Bluetooth base UUID so that short and long forms compare equal.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uuid {
    bytes: [u8; 16],
}

/// "00000000-0000-1000-8000-00805F9B34FB", little-endian.
const BASE_UUID_BYTES: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const BASE_OFFSET: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UuidParseError {
    #[error("UUID must have 4 or 32 hex digits, got {0}")]
    InvalidLength(usize),

    #[error("UUID contains invalid characters")]
    InvalidFormat,
}

impl Uuid {
    /// Creates a UUID from its numeric 128-bit value, e.g.
    /// `0x10000000_1000_1000_8000_00805f9baaaa`.
    pub const fn from_u128(value: u128) -> Self {
        Uuid {
            bytes: value.to_le_bytes(),
        }
    }

    /// Creates a UUID from a 16-bit SIG-assigned value.
    pub const fn from_u16(uuid16: u16) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid16 as u8;
        bytes[BASE_OFFSET + 1] = (uuid16 >> 8) as u8;
        Uuid { bytes }
    }

    /// Creates a UUID from 16 bytes in little-endian order.
    pub const fn from_bytes_le(bytes: [u8; 16]) -> Self {
        Uuid { bytes }
    }

    pub const fn as_bytes_le(&self) -> &[u8; 16] {
        &self.bytes
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.bytes)
    }

    /// Returns the short form if this is a SIG-assigned 16-bit UUID.
    pub fn as_u16(&self) -> Option<u16> {
        let sig_assigned = self.bytes[0..BASE_OFFSET] == BASE_UUID_BYTES[0..BASE_OFFSET];
        if sig_assigned && self.bytes[BASE_OFFSET + 2] == 0 && self.bytes[BASE_OFFSET + 3] == 0 {
            Some(u16::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
            ]))
        } else {
            None
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u128> for Uuid {
    fn from(value: u128) -> Self {
        Uuid::from_u128(value)
    }
}

impl PartialEq<u16> for Uuid {
    fn eq(&self, other: &u16) -> bool {
        self.as_u16() == Some(*other)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b = self.bytes;
        b.reverse();
        let h = hex::encode(b);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(short) => write!(f, "Uuid(0x{:04X})", short),
            None => write!(f, "Uuid({})", self),
        }
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Accepts the 16-bit short form ("2A00", "0x2A00") and the 128-bit form
    /// with or without hyphens, in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let cleaned: String = trimmed.chars().filter(|c| *c != '-').collect();
        if !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UuidParseError::InvalidFormat);
        }

        match cleaned.len() {
            4 => u16::from_str_radix(&cleaned, 16)
                .map(Uuid::from_u16)
                .map_err(|_| UuidParseError::InvalidFormat),
            32 => {
                let mut bytes = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut bytes)
                    .map_err(|_| UuidParseError::InvalidFormat)?;
                bytes.reverse();
                Ok(Uuid::from_bytes_le(bytes))
            }
            n => Err(UuidParseError::InvalidLength(n)),
        }
    }
}
