//! In-memory transport
//!
//! `SimTransport` stands in for a radio: peripherals are registered with
//! their GATT profile, and the owner injects notifications, link loss and
//! failures from whatever thread plays the role of the radio event loop.

use super::{DisconnectCallback, DisconnectReason, NotificationCallback, ScanControl, Transport};
use crate::error::TransportError;
use crate::gap::{AdvertisingReport, BdAddr, DeviceIdentity};
use crate::gatt::router::{BCP_NOTIFY, BCP_WRITE, MMP_NOTIFY, MMP_WRITE};
use crate::gatt::{CharacteristicDescriptor, CharacteristicProperty, ServiceDescriptor};
use crate::uuid::Uuid;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

/// GAP Device Name characteristic
pub const DEVICE_NAME: Uuid = Uuid::from_u16(0x2A00);

#[derive(Default)]
struct SimPeripheral {
    services: Vec<ServiceDescriptor>,
    values: HashMap<Uuid, Vec<u8>>,
    written: Vec<(Uuid, Vec<u8>)>,
    subscriptions: HashMap<Uuid, NotificationCallback>,
    on_disconnect: Option<DisconnectCallback>,
    connected: bool,
    fail_next_connect: Option<TransportError>,
    fail_discovery: bool,
    discovery_delay: Option<Duration>,
    drop_during_discovery: bool,
    fail_disconnect: bool,
    reject_writes: bool,
    connect_delay: Option<Duration>,
    discover_count: usize,
}

impl SimPeripheral {
    fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.services
            .iter()
            .any(|service| service.characteristic(uuid).is_some())
    }
}

struct SimState {
    adapter_available: bool,
    peripherals: HashMap<BdAddr, SimPeripheral>,
    advertisements: Vec<AdvertisingReport>,
}

/// A transport backed by simulated peripherals
pub struct SimTransport {
    state: Mutex<SimState>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                adapter_available: true,
                peripherals: HashMap::new(),
                advertisements: Vec::new(),
            }),
        }
    }

    /// Register a connectable peripheral with the given GATT profile
    pub fn add_peripheral(&self, address: BdAddr, services: Vec<ServiceDescriptor>) {
        let peripheral = SimPeripheral {
            services,
            ..SimPeripheral::default()
        };
        self.state.lock().peripherals.insert(address, peripheral);
    }

    /// Queue an advertisement for every subsequent scan
    pub fn advertise(&self, report: AdvertisingReport) {
        self.state.lock().advertisements.push(report);
    }

    pub fn set_adapter_available(&self, available: bool) {
        self.state.lock().adapter_available = available;
    }

    pub fn set_value(&self, address: BdAddr, characteristic: Uuid, value: Vec<u8>) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.values.insert(characteristic, value);
        }
    }

    /// Make the next connection attempt to `address` fail with `error`
    pub fn fail_next_connect(&self, address: BdAddr, error: TransportError) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.fail_next_connect = Some(error);
        }
    }

    pub fn set_fail_discovery(&self, address: BdAddr, fail: bool) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.fail_discovery = fail;
        }
    }

    /// Keep discovery busy for `delay` before it looks at the peripheral
    pub fn set_discovery_delay(&self, address: BdAddr, delay: Option<Duration>) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.discovery_delay = delay;
        }
    }

    /// Lose the link while the next discovery is answering
    pub fn drop_link_during_discovery(&self, address: BdAddr) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.drop_during_discovery = true;
        }
    }

    /// Make disconnect requests fail; the link stays up
    pub fn set_fail_disconnect(&self, address: BdAddr, fail: bool) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.fail_disconnect = fail;
        }
    }

    pub fn set_reject_writes(&self, address: BdAddr, reject: bool) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.reject_writes = reject;
        }
    }

    /// Delay link establishment; attempts with a shorter timeout time out
    pub fn set_connect_delay(&self, address: BdAddr, delay: Option<Duration>) {
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(&address) {
            peripheral.connect_delay = delay;
        }
    }

    /// Deliver a notification from `address` on the calling thread.
    ///
    /// Returns `false` if nobody is subscribed to `characteristic`.
    pub fn notify(&self, address: BdAddr, characteristic: Uuid, payload: &[u8]) -> bool {
        let callback = {
            let state = self.state.lock();
            state
                .peripherals
                .get(&address)
                .filter(|p| p.connected)
                .and_then(|p| p.subscriptions.get(&characteristic).cloned())
        };

        match callback {
            Some(callback) => {
                callback(&characteristic, payload);
                true
            }
            None => {
                trace!("No subscriber for {} on {}", characteristic, address);
                false
            }
        }
    }

    /// Drop the link as if the peer went out of range
    pub fn drop_link(&self, address: BdAddr, reason: DisconnectReason) {
        let callback = {
            let mut state = self.state.lock();
            match state.peripherals.get_mut(&address) {
                Some(peripheral) if peripheral.connected => {
                    peripheral.connected = false;
                    peripheral.subscriptions.clear();
                    peripheral.on_disconnect.take()
                }
                _ => None,
            }
        };

        if let Some(callback) = callback {
            debug!("Simulated link loss for {}: {:?}", address, reason);
            callback(&DeviceIdentity::new(address), reason);
        }
    }

    pub fn is_connected(&self, address: BdAddr) -> bool {
        self.state
            .lock()
            .peripherals
            .get(&address)
            .map_or(false, |p| p.connected)
    }

    pub fn is_subscribed(&self, address: BdAddr, characteristic: Uuid) -> bool {
        self.state
            .lock()
            .peripherals
            .get(&address)
            .map_or(false, |p| p.subscriptions.contains_key(&characteristic))
    }

    /// Every write the peripheral accepted, oldest first
    pub fn writes(&self, address: BdAddr) -> Vec<(Uuid, Vec<u8>)> {
        self.state
            .lock()
            .peripherals
            .get(&address)
            .map(|p| p.written.clone())
            .unwrap_or_default()
    }

    pub fn discover_count(&self, address: BdAddr) -> usize {
        self.state
            .lock()
            .peripherals
            .get(&address)
            .map_or(0, |p| p.discover_count)
    }

    fn with_connected<T>(
        &self,
        identity: &DeviceIdentity,
        f: impl FnOnce(&mut SimPeripheral) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.state.lock();
        if !state.adapter_available {
            return Err(TransportError::Unavailable("adapter removed".into()));
        }
        let peripheral = state
            .peripherals
            .get_mut(&identity.address)
            .ok_or_else(|| TransportError::UnknownDevice(identity.address.to_string()))?;
        if !peripheral.connected {
            return Err(TransportError::LinkLost);
        }
        f(peripheral)
    }
}

impl Transport for SimTransport {
    fn connect(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
        on_disconnect: DisconnectCallback,
    ) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state.lock();
            if !state.adapter_available {
                return Err(TransportError::Unavailable("adapter removed".into()));
            }
            // An address nobody advertises never answers
            let peripheral = state
                .peripherals
                .get_mut(&identity.address)
                .ok_or(TransportError::Timeout)?;
            if let Some(error) = peripheral.fail_next_connect.take() {
                return Err(error);
            }
            peripheral.connect_delay
        };

        if let Some(delay) = delay {
            thread::sleep(delay.min(timeout));
            if delay > timeout {
                return Err(TransportError::Timeout);
            }
        }

        let mut state = self.state.lock();
        let peripheral = state
            .peripherals
            .get_mut(&identity.address)
            .ok_or(TransportError::Timeout)?;
        // A link that is already up stays with whoever brought it up
        if !peripheral.connected {
            peripheral.connected = true;
            peripheral.on_disconnect = Some(on_disconnect);
        }
        Ok(())
    }

    fn disconnect(
        &self,
        identity: &DeviceIdentity,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(peripheral) = state.peripherals.get_mut(&identity.address) {
            if peripheral.fail_disconnect {
                return Err(TransportError::Timeout);
            }
            peripheral.connected = false;
            peripheral.subscriptions.clear();
            peripheral.on_disconnect = None;
        }
        Ok(())
    }

    fn discover(&self, identity: &DeviceIdentity) -> Result<Vec<ServiceDescriptor>, TransportError> {
        let delay = self.with_connected(identity, |peripheral| Ok(peripheral.discovery_delay))?;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let (services, drop_link) = self.with_connected(identity, |peripheral| {
            peripheral.discover_count += 1;
            if peripheral.fail_discovery {
                return Err(TransportError::Rejected("attribute database unavailable".into()));
            }
            let drop_link = std::mem::take(&mut peripheral.drop_during_discovery);
            Ok((peripheral.services.clone(), drop_link))
        })?;

        if drop_link {
            self.drop_link(identity.address, DisconnectReason::ConnectionTimeout);
        }
        Ok(services)
    }

    fn read(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.with_connected(identity, |peripheral| {
            peripheral
                .values
                .get(characteristic)
                .cloned()
                .ok_or_else(|| TransportError::UnknownCharacteristic(characteristic.to_string()))
        })
    }

    fn write(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.with_connected(identity, |peripheral| {
            if peripheral.reject_writes {
                return Err(TransportError::Rejected("write not permitted".into()));
            }
            if !peripheral.has_characteristic(characteristic) {
                return Err(TransportError::UnknownCharacteristic(
                    characteristic.to_string(),
                ));
            }
            peripheral.written.push((*characteristic, data.to_vec()));
            peripheral.values.insert(*characteristic, data.to_vec());
            Ok(())
        })
    }

    fn subscribe(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        on_notification: NotificationCallback,
    ) -> Result<(), TransportError> {
        self.with_connected(identity, |peripheral| {
            if !peripheral.has_characteristic(characteristic) {
                return Err(TransportError::UnknownCharacteristic(
                    characteristic.to_string(),
                ));
            }
            peripheral
                .subscriptions
                .insert(*characteristic, on_notification);
            Ok(())
        })
    }

    fn unsubscribe(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
    ) -> Result<(), TransportError> {
        self.with_connected(identity, |peripheral| {
            peripheral.subscriptions.remove(characteristic);
            Ok(())
        })
    }

    fn scan(
        &self,
        timeout: Duration,
        on_report: &mut dyn FnMut(AdvertisingReport) -> ScanControl,
    ) -> Result<(), TransportError> {
        let reports = {
            let state = self.state.lock();
            if !state.adapter_available {
                return Err(TransportError::Unavailable("adapter removed".into()));
            }
            state.advertisements.clone()
        };

        for report in reports {
            if on_report(report) == ScanControl::Stop {
                return Ok(());
            }
        }

        // Nothing else on the air; listen out the rest of the window
        thread::sleep(timeout);
        Ok(())
    }
}

/// The GATT profile of a milk meter: generic access plus the two vendor
/// services "MMP" and "BCP", each with a write and a notify characteristic.
pub fn milk_meter_profile() -> Vec<ServiceDescriptor> {
    let write = CharacteristicProperty::WRITE | CharacteristicProperty::WRITE_WITHOUT_RESPONSE;
    let notify = CharacteristicProperty::NOTIFY;

    vec![
        ServiceDescriptor::new(Uuid::from_u16(0x1800), "Generic Access").with_characteristic(
            CharacteristicDescriptor::new(DEVICE_NAME, "Device Name", CharacteristicProperty::READ),
        ),
        ServiceDescriptor::new(
            Uuid::from_u128(0x10000000_0000_1000_8000_00805f9baaaa),
            "MMP",
        )
        .with_characteristic(CharacteristicDescriptor::new(MMP_WRITE, "MMP write", write))
        .with_characteristic(CharacteristicDescriptor::new(MMP_NOTIFY, "MMP notify", notify)),
        ServiceDescriptor::new(
            Uuid::from_u128(0x40000000_0000_1000_8000_00805f9baaaa),
            "BCP",
        )
        .with_characteristic(CharacteristicDescriptor::new(BCP_WRITE, "BCP write", write))
        .with_characteristic(CharacteristicDescriptor::new(BCP_NOTIFY, "BCP notify", notify)),
    ]
}
