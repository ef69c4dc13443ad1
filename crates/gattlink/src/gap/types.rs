use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 48-bit device address, stored little-endian as the radio reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("expected 6 address octets, got {0}")]
    WrongLength(usize),

    #[error("invalid address octet: {0:?}")]
    InvalidOctet(String),
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = AddressParseError;

    /// Parses the human-readable "AA:BB:CC:DD:EE:FF" form (`-` separators
    /// are accepted too). The first octet written is the most significant.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.trim().split(&[':', '-'][..]).collect();
        if octets.len() != 6 {
            return Err(AddressParseError::WrongLength(octets.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, octet) in octets.iter().enumerate() {
            let mut value = [0u8; 1];
            hex::decode_to_slice(octet, &mut value)
                .map_err(|_| AddressParseError::InvalidOctet(octet.to_string()))?;
            bytes[5 - i] = value[0];
        }
        Ok(Self { bytes })
    }
}

/// Who we are talking to: the peer address plus, optionally, the local
/// adapter (serial port, HCI index, ...) that should carry the link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub address: BdAddr,
    pub adapter: Option<String>,
}

impl DeviceIdentity {
    pub fn new(address: BdAddr) -> Self {
        Self {
            address,
            adapter: None,
        }
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }
}

impl From<BdAddr> for DeviceIdentity {
    fn from(address: BdAddr) -> Self {
        Self::new(address)
    }
}

impl FromStr for DeviceIdentity {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<BdAddr>().map(DeviceIdentity::new)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.adapter {
            Some(adapter) => write!(f, "{}@{}", self.address, adapter),
            None => write!(f, "{}", self.address),
        }
    }
}

/// One advertisement sighting as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    pub address: BdAddr,
    pub event_type: u8,
    pub rssi: i8,
    pub data: Vec<u8>,
}

/// A device found by [`crate::gap::Scanner`], with the metadata of its
/// first sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub identity: DeviceIdentity,
    pub rssi: i8,
    pub event_type: u8,
    pub adv_data: Vec<u8>,
    pub local_name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
}

impl DiscoveredDevice {
    /// Manufacturer data as an upper-case hex string, if advertised.
    pub fn manufacturer_data_hex(&self) -> Option<String> {
        self.manufacturer_data.as_ref().map(hex::encode_upper)
    }
}
