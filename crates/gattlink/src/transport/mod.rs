//! Radio transport boundary
//!
//! A [`Transport`] is whatever actually talks to the controller: a Nordic
//! connectivity dongle, BlueZ, CoreBluetooth, or the in-memory
//! [`sim::SimTransport`]. Sessions only ever go through this trait.
//!
//! Callbacks handed to a transport are invoked on the transport's own event
//! thread. They must return quickly and never call back into the transport.

pub mod sim;

use crate::error::TransportError;
use crate::gap::{AdvertisingReport, DeviceIdentity};
use crate::gatt::ServiceDescriptor;
use crate::uuid::Uuid;
use std::sync::Arc;
use std::time::Duration;

/// Called for every notification received on a subscribed characteristic
pub type NotificationCallback = Arc<dyn Fn(&Uuid, &[u8]) + Send + Sync + 'static>;

/// Called once when an established link goes down without being asked to
pub type DisconnectCallback = Arc<dyn Fn(&DeviceIdentity, DisconnectReason) + Send + Sync + 'static>;

/// HCI disconnect reason codes we care about
pub const REASON_CONNECTION_TIMEOUT: u8 = 0x08;
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;
pub const REASON_LOCAL_HOST_TERMINATED: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionTimeout,
    RemoteUserTerminated,
    LocalHostTerminated,
    Other(u8),
}

impl From<u8> for DisconnectReason {
    fn from(value: u8) -> Self {
        match value {
            REASON_CONNECTION_TIMEOUT => DisconnectReason::ConnectionTimeout,
            REASON_REMOTE_USER_TERMINATED => DisconnectReason::RemoteUserTerminated,
            REASON_LOCAL_HOST_TERMINATED => DisconnectReason::LocalHostTerminated,
            other => DisconnectReason::Other(other),
        }
    }
}

impl From<DisconnectReason> for u8 {
    fn from(value: DisconnectReason) -> Self {
        match value {
            DisconnectReason::ConnectionTimeout => REASON_CONNECTION_TIMEOUT,
            DisconnectReason::RemoteUserTerminated => REASON_REMOTE_USER_TERMINATED,
            DisconnectReason::LocalHostTerminated => REASON_LOCAL_HOST_TERMINATED,
            DisconnectReason::Other(code) => code,
        }
    }
}

/// Whether a scan should keep delivering sightings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Client-side primitives of a BLE central radio
pub trait Transport: Send + Sync {
    /// Establish a link, blocking for at most `timeout`.
    ///
    /// `on_disconnect` must be invoked if the link later drops on its own.
    fn connect(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
        on_disconnect: DisconnectCallback,
    ) -> Result<(), TransportError>;

    fn disconnect(&self, identity: &DeviceIdentity, timeout: Duration)
        -> Result<(), TransportError>;

    /// Enumerate every primary service with its characteristics
    fn discover(&self, identity: &DeviceIdentity) -> Result<Vec<ServiceDescriptor>, TransportError>;

    fn read(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    fn write(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Enable notifications and route them to `on_notification`
    fn subscribe(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        on_notification: NotificationCallback,
    ) -> Result<(), TransportError>;

    fn unsubscribe(&self, identity: &DeviceIdentity, characteristic: &Uuid)
        -> Result<(), TransportError>;

    /// Listen for advertisements for up to `timeout`, handing each sighting
    /// to `on_report` until it answers [`ScanControl::Stop`].
    fn scan(
        &self,
        timeout: Duration,
        on_report: &mut dyn FnMut(AdvertisingReport) -> ScanControl,
    ) -> Result<(), TransportError>;
}
