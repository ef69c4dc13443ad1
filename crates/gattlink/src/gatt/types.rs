//! Common types for GATT operations
//!
//! Descriptors here are what discovery hands back and what the session
//! caches for the lifetime of a connection.

use crate::uuid::Uuid;
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Characteristic properties as defined in the Bluetooth specification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperty: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperty {
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    /// With or without response
    pub fn can_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    /// Notify or indicate
    pub fn can_notify(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

impl fmt::Display for CharacteristicProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_lowercase().replace('_', "-"))
            .collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub description: String,
    pub properties: CharacteristicProperty,
}

impl CharacteristicDescriptor {
    pub fn new(
        uuid: Uuid,
        description: impl Into<String>,
        properties: CharacteristicProperty,
    ) -> Self {
        Self {
            uuid,
            description: description.into(),
            properties,
        }
    }
}

/// A discovered primary service with its characteristics in handle order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub description: String,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(uuid: Uuid, description: impl Into<String>) -> Self {
        Self {
            uuid,
            description: description.into(),
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicDescriptor) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Find a characteristic anywhere in a discovered attribute database
pub fn find_characteristic<'a>(
    services: &'a [ServiceDescriptor],
    uuid: &Uuid,
) -> Option<&'a CharacteristicDescriptor> {
    services.iter().find_map(|service| service.characteristic(uuid))
}

/// One characteristic entry of a [`ServiceMap`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicEntry {
    pub description: String,
    pub properties: CharacteristicProperty,
    pub uuid: Uuid,
}

/// Discovered services keyed by (UUID, description), in discovery order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMap {
    entries: Vec<((Uuid, String), Vec<CharacteristicEntry>)>,
}

impl ServiceMap {
    pub fn from_services(services: &[ServiceDescriptor]) -> Self {
        let entries = services
            .iter()
            .map(|service| {
                let characteristics = service
                    .characteristics
                    .iter()
                    .map(|c| CharacteristicEntry {
                        description: c.description.clone(),
                        properties: c.properties,
                        uuid: c.uuid,
                    })
                    .collect();
                ((service.uuid, service.description.clone()), characteristics)
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, service: &Uuid) -> Option<&[CharacteristicEntry]> {
        self.entries
            .iter()
            .find(|((uuid, _), _)| uuid == service)
            .map(|(_, characteristics)| characteristics.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(Uuid, String), &[CharacteristicEntry])> {
        self.entries
            .iter()
            .map(|(key, characteristics)| (key, characteristics.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ServiceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ((uuid, description), characteristics) in &self.entries {
            writeln!(f, "Service: {} ({})", description, uuid)?;
            for c in characteristics {
                writeln!(
                    f,
                    "    Characteristic: {} {} ({})",
                    c.description, c.properties, c.uuid
                )?;
            }
        }
        Ok(())
    }
}
