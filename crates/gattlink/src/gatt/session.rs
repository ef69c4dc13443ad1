//! Device session
//!
//! A session owns the connection lifecycle of one peer:
//!
//! `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`
//!
//! Connecting runs discovery, binds the routing configuration and subscribes
//! every routed notify characteristic. Link loss reported by the transport
//! drops the session straight back to `Disconnected`.
//!
//! Locks are always taken state first. The transport is never called with the
//! state lock held, since its callbacks take that lock themselves.

use crate::error::{Error, Result, TransportError};
use crate::gap::DeviceIdentity;
use crate::gatt::router::{notification_sink, RoutingConfig, ServiceRouter, ServiceTag};
use crate::gatt::types::{find_characteristic, ServiceDescriptor, ServiceMap};
use crate::queue::{EndReason, NotificationQueue};
use crate::transport::{DisconnectCallback, DisconnectReason, Transport};
use crate::uuid::Uuid;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Used when a session is dropped while still connected
const DROP_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Defines the connection state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct StateCell {
    state: ConnectionState,
    /// Bumped on every connection attempt so stale callbacks and cancelled
    /// attempts can tell they are no longer current
    epoch: u64,
}

struct SessionInner {
    identity: DeviceIdentity,
    transport: Arc<dyn Transport>,
    queue: Arc<NotificationQueue>,
    routing: RoutingConfig,
    state: RwLock<StateCell>,
    services: RwLock<Option<Arc<[ServiceDescriptor]>>>,
    router: RwLock<Option<Arc<ServiceRouter>>>,
    discovery: Mutex<()>,
    /// Characteristics subscribed with `start_notify`
    extra_subscriptions: Mutex<Vec<Uuid>>,
}

impl SessionInner {
    fn handle_link_loss(&self, epoch: u64, reason: DisconnectReason) {
        let mut cell = self.state.write();
        if cell.epoch != epoch
            || !matches!(
                cell.state,
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            return;
        }

        warn!("Link to {} lost: {:?}", self.identity, reason);
        cell.state = ConnectionState::Disconnected;
        self.queue.end_stream(&self.identity, EndReason::LinkLost);
        self.services.write().take();
        self.router.write().take();
        self.extra_subscriptions.lock().clear();
    }

    /// Undo a connection whose setup failed after the link came up
    fn abort_setup(&self, epoch: u64) {
        {
            let mut cell = self.state.write();
            if cell.epoch != epoch || cell.state != ConnectionState::Connected {
                // Link loss or an explicit disconnect already cleaned up
                return;
            }
            cell.state = ConnectionState::Disconnecting;
            self.queue.end_stream(&self.identity, EndReason::Closed);
        }

        self.router.write().take();
        self.services.write().take();
        if let Err(e) = self
            .transport
            .disconnect(&self.identity, DROP_DISCONNECT_TIMEOUT)
        {
            warn!("Failed to drop link to {}: {}", self.identity, e);
        }
        self.state.write().state = ConnectionState::Disconnected;
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().state;
        if matches!(
            state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            debug!("Session for {} dropped while connected", self.identity);
            self.queue.end_stream(&self.identity, EndReason::Closed);
            if let Err(e) = self
                .transport
                .disconnect(&self.identity, DROP_DISCONNECT_TIMEOUT)
            {
                warn!("Failed to disconnect {} on drop: {}", self.identity, e);
            }
        }
    }
}

/// The connection to one peer device
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn Transport>,
        queue: Arc<NotificationQueue>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                identity,
                transport,
                queue,
                routing,
                state: RwLock::new(StateCell {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                }),
                services: RwLock::new(None),
                router: RwLock::new(None),
                discovery: Mutex::new(()),
                extra_subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.inner.queue
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.inner.routing
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The routing table, present once the session is fully set up
    pub fn router(&self) -> Option<Arc<ServiceRouter>> {
        self.inner.router.read().clone()
    }

    /// The cached attribute database, if discovery has run
    pub fn services(&self) -> Option<Arc<[ServiceDescriptor]>> {
        self.inner.services.read().clone()
    }

    /// Changes with every connection attempt
    pub(crate) fn connection_epoch(&self) -> u64 {
        self.inner.state.read().epoch
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn link_loss_callback(&self, epoch: u64) -> DisconnectCallback {
        let inner: Weak<SessionInner> = Arc::downgrade(&self.inner);
        Arc::new(move |_: &DeviceIdentity, reason: DisconnectReason| {
            if let Some(inner) = inner.upgrade() {
                inner.handle_link_loss(epoch, reason);
            }
        })
    }

    /// Connect, discover services and subscribe every routed notify
    /// characteristic.
    ///
    /// Only allowed from `Disconnected`. Any failure leaves the session
    /// `Disconnected` and ready for another attempt.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        let identity = &self.inner.identity;
        let epoch = {
            let mut cell = self.inner.state.write();
            match cell.state {
                ConnectionState::Disconnected => {}
                ConnectionState::Connected => {
                    return Err(Error::Connection("already connected".to_string()))
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    return Err(Error::Busy)
                }
            }
            cell.state = ConnectionState::Connecting;
            cell.epoch += 1;
            cell.epoch
        };

        info!("Connecting to {} (timeout {:?})", identity, timeout);
        let on_disconnect = self.link_loss_callback(epoch);
        if let Err(e) = self.inner.transport.connect(identity, timeout, on_disconnect) {
            let mut cell = self.inner.state.write();
            if cell.epoch == epoch && cell.state == ConnectionState::Connecting {
                cell.state = ConnectionState::Disconnected;
            }
            warn!("Connection to {} failed: {}", identity, e);
            return Err(Error::Connection(format!(
                "connecting to {} failed: {}",
                identity, e
            )));
        }

        {
            let mut cell = self.inner.state.write();
            if cell.epoch != epoch || cell.state != ConnectionState::Connecting {
                // A newer attempt owns the link now; only undo our own
                let ours = cell.epoch == epoch;
                drop(cell);
                info!("Connection attempt to {} was cancelled", identity);
                if ours {
                    if let Err(e) = self
                        .inner
                        .transport
                        .disconnect(identity, DROP_DISCONNECT_TIMEOUT)
                    {
                        warn!("Failed to drop cancelled link to {}: {}", identity, e);
                    }
                }
                return Err(Error::Connection(format!(
                    "connection to {} cancelled",
                    identity
                )));
            }
            cell.state = ConnectionState::Connected;
            self.inner.queue.open_stream(identity);
        }
        info!("Connected to {}", identity);

        if let Err(e) = self.establish(epoch) {
            error!("Setting up {} failed: {}", identity, e);
            self.inner.abort_setup(epoch);
            return Err(e);
        }
        Ok(())
    }

    fn establish(&self, epoch: u64) -> Result<()> {
        let identity = &self.inner.identity;
        let services = self.discover_services()?;
        let router = ServiceRouter::bind(&self.inner.routing, &services)?;
        router.subscribe_all(&*self.inner.transport, identity, &self.inner.queue)?;

        let cell = self.inner.state.read();
        if cell.epoch != epoch || cell.state != ConnectionState::Connected {
            return Err(Error::Connection(format!(
                "link to {} lost during setup",
                identity
            )));
        }
        for route in router.routes() {
            debug!("{}: {} -> write {}", identity, route.tag, route.write);
        }
        *self.inner.router.write() = Some(Arc::new(router));
        Ok(())
    }

    /// Like [`connect`](Self::connect) but reports failure as `false`
    pub fn try_connect(&self, timeout: Duration) -> bool {
        match self.connect(timeout) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to connect to {}: {}", self.inner.identity, e);
                false
            }
        }
    }

    /// Tear the connection down.
    ///
    /// Undelivered notifications of this device are discarded. A connect in
    /// flight fails once the transport returns.
    pub fn disconnect(&self, timeout: Duration) -> Result<()> {
        let identity = &self.inner.identity;
        {
            let mut cell = self.inner.state.write();
            match cell.state {
                ConnectionState::Connected | ConnectionState::Connecting => {}
                ConnectionState::Disconnecting => return Err(Error::Busy),
                ConnectionState::Disconnected => return Err(Error::NotConnected),
            }
            cell.state = ConnectionState::Disconnecting;
            self.inner.queue.end_stream(identity, EndReason::Closed);
        }
        info!("Disconnecting from {}", identity);

        let router = self.inner.router.write().take();
        if let Some(router) = router {
            router.unsubscribe_all(&*self.inner.transport, identity);
        }
        let extra: Vec<Uuid> = self.inner.extra_subscriptions.lock().drain(..).collect();
        for uuid in extra {
            if let Err(e) = self.inner.transport.unsubscribe(identity, &uuid) {
                warn!("Failed to unsubscribe {} on {}: {}", uuid, identity, e);
            }
        }

        let result = self.inner.transport.disconnect(identity, timeout);
        self.inner.services.write().take();
        self.inner.state.write().state = ConnectionState::Disconnected;

        result.map_err(|e| {
            Error::Connection(format!("disconnecting from {} failed: {}", identity, e))
        })?;
        info!("Disconnected from {}", identity);
        Ok(())
    }

    /// Like [`disconnect`](Self::disconnect) but reports failure as `false`
    pub fn try_disconnect(&self, timeout: Duration) -> bool {
        match self.disconnect(timeout) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to disconnect from {}: {}", self.inner.identity, e);
                false
            }
        }
    }

    /// Discover the peer's services, or return the cached result.
    ///
    /// A second discovery while one is running fails with [`Error::Busy`].
    pub fn discover_services(&self) -> Result<Arc<[ServiceDescriptor]>> {
        let identity = &self.inner.identity;
        let epoch = {
            let cell = self.inner.state.read();
            if cell.state != ConnectionState::Connected {
                return Err(Error::NotConnected);
            }
            cell.epoch
        };

        if let Some(cached) = self.services() {
            return Ok(cached);
        }

        let _discovering = self.inner.discovery.try_lock().ok_or(Error::Busy)?;
        if let Some(cached) = self.services() {
            return Ok(cached);
        }

        debug!("Discovering services on {}", identity);
        let services: Arc<[ServiceDescriptor]> = self
            .inner
            .transport
            .discover(identity)
            .map_err(|e| match e {
                TransportError::LinkLost => {
                    Error::Discovery("link lost during discovery".to_string())
                }
                e => Error::Discovery(format!("{}: {}", identity, e)),
            })?
            .into();

        let cell = self.inner.state.read();
        if cell.epoch != epoch || cell.state != ConnectionState::Connected {
            return Err(Error::Discovery("link lost during discovery".to_string()));
        }
        *self.inner.services.write() = Some(Arc::clone(&services));
        info!("Discovered {} services on {}", services.len(), identity);
        Ok(services)
    }

    /// Discovered services as a (UUID, description) keyed map
    pub fn service_map(&self) -> Result<ServiceMap> {
        self.discover_services()
            .map(|services| ServiceMap::from_services(&services))
    }

    pub fn read_characteristic(&self, uuid: &Uuid, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let value = self
            .inner
            .transport
            .read(&self.inner.identity, uuid, timeout)
            .map_err(|e| match e {
                TransportError::Timeout => Error::ReadTimeout,
                TransportError::LinkLost => Error::NotConnected,
                e => Error::Transport(e),
            })?;
        trace!("Read {} from {}: {}", uuid, self.inner.identity, hex::encode(&value));
        Ok(value)
    }

    pub fn write_characteristic(&self, uuid: &Uuid, data: &[u8], timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        trace!("Write {} to {}: {}", uuid, self.inner.identity, hex::encode(data));
        self.inner
            .transport
            .write(&self.inner.identity, uuid, data, timeout)
            .map_err(|e| match e {
                TransportError::LinkLost => Error::NotConnected,
                e => Error::Write(format!("{}: {}", uuid, e)),
            })
    }

    /// Subscribe a characteristic outside the routing table; its
    /// notifications are queued under `tag`.
    pub fn start_notify(&self, uuid: &Uuid, tag: &str) -> Result<()> {
        let services = self.discover_services()?;
        let characteristic = find_characteristic(&services, uuid)
            .ok_or_else(|| Error::Discovery(format!("characteristic {} not found", uuid)))?;
        if !characteristic.properties.can_notify() {
            return Err(Error::Discovery(format!(
                "characteristic {} does not notify",
                uuid
            )));
        }

        let identity = &self.inner.identity;
        let sink = notification_sink(
            Arc::clone(&self.inner.queue),
            identity.clone(),
            ServiceTag::new(tag),
        );
        self.inner.transport.subscribe(identity, uuid, sink)?;
        self.inner.extra_subscriptions.lock().push(*uuid);
        debug!("Notifications from {} on {} enabled as {}", uuid, identity, tag);
        Ok(())
    }

    pub fn stop_notify(&self, uuid: &Uuid) -> Result<()> {
        self.ensure_connected()?;
        let removed = {
            let mut extra = self.inner.extra_subscriptions.lock();
            let before = extra.len();
            extra.retain(|subscribed| subscribed != uuid);
            before != extra.len()
        };
        if !removed {
            return Err(Error::Configuration(format!(
                "notifications from {} were not started",
                uuid
            )));
        }
        self.inner.transport.unsubscribe(&self.inner.identity, uuid)?;
        Ok(())
    }
}
