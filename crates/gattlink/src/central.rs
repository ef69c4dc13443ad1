//! Multi-device central
//!
//! Several peers share one notification queue. Connection results are
//! reported as booleans and logged, for discovery-style tooling that just
//! wants to know which devices came up.

use crate::client::DEFAULT_CONNECTION_TIMEOUT;
use crate::error::Result;
use crate::gap::{DeviceIdentity, DiscoveredDevice, Scanner};
use crate::gatt::{DeviceSession, RoutingConfig};
use crate::queue::{NotificationEvent, NotificationQueue};
use crate::transport::Transport;
use log::{info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct Central {
    transport: Arc<dyn Transport>,
    queue: Arc<NotificationQueue>,
    scanner: Scanner,
    routing: RoutingConfig,
    connection_timeout: Duration,
    sessions: RwLock<HashMap<DeviceIdentity, DeviceSession>>,
}

impl Central {
    /// Every device is connected with the same `routing`
    pub fn new(transport: Arc<dyn Transport>, routing: RoutingConfig) -> Self {
        Self {
            scanner: Scanner::new(Arc::clone(&transport)),
            transport,
            queue: Arc::new(NotificationQueue::new()),
            routing,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }

    pub fn scan_ms(&self, addresses: &[&str], timeout_ms: u64) -> Result<Vec<DiscoveredDevice>> {
        self.scanner.scan_ms(addresses, timeout_ms)
    }

    /// The session for `identity`, created on first use
    pub fn session(&self, identity: &DeviceIdentity) -> DeviceSession {
        if let Some(session) = self.sessions.read().get(identity) {
            return session.clone();
        }
        self.sessions
            .write()
            .entry(identity.clone())
            .or_insert_with(|| {
                DeviceSession::new(
                    identity.clone(),
                    Arc::clone(&self.transport),
                    Arc::clone(&self.queue),
                    self.routing.clone(),
                )
            })
            .clone()
    }

    pub fn connect(&self, identity: &DeviceIdentity) -> bool {
        self.session(identity).try_connect(self.connection_timeout)
    }

    pub fn disconnect(&self, identity: &DeviceIdentity) -> bool {
        let session = self.sessions.read().get(identity).cloned();
        match session {
            Some(session) => session.try_disconnect(self.connection_timeout),
            None => {
                warn!("Not connected to {}", identity);
                false
            }
        }
    }

    pub fn is_connected(&self, identity: &DeviceIdentity) -> bool {
        self.sessions
            .read()
            .get(identity)
            .map_or(false, |session| session.is_connected())
    }

    pub fn connected_devices(&self) -> Vec<DeviceIdentity> {
        let mut devices: Vec<DeviceIdentity> = self
            .sessions
            .read()
            .values()
            .filter(|session| session.is_connected())
            .map(|session| session.identity().clone())
            .collect();
        devices.sort_by_key(|identity| identity.address);
        devices
    }

    /// Notifications from every device in arrival order, waiting up to
    /// `max_wait` for the first one
    pub fn next_notifications(&self, max_wait: Option<Duration>) -> Vec<NotificationEvent> {
        self.queue.drain_all(max_wait)
    }

    /// Returns how many devices were disconnected
    pub fn disconnect_all(&self) -> usize {
        let sessions: Vec<DeviceSession> = self.sessions.read().values().cloned().collect();
        let count = sessions
            .iter()
            .filter(|session| session.is_connected())
            .filter(|session| session.try_disconnect(self.connection_timeout))
            .count();
        info!("Disconnected {} device(s)", count);
        count
    }
}
