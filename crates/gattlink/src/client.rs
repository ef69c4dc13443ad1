//! Single-device client
//!
//! `Client` is the serial-port style front end: one peer, one byte stream,
//! writes routed to whichever logical service accepts them.

use crate::error::{Error, Result};
use crate::gap::DeviceIdentity;
use crate::gatt::{DeviceSession, RoutingConfig, ServiceMap};
use crate::logging;
use crate::queue::{EndReason, NotificationQueue};
use crate::stream::ByteStream;
use crate::transport::Transport;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub identity: DeviceIdentity,
    /// Zero blocks reads until they are satisfied
    pub read_timeout: Duration,
    pub connection_timeout: Duration,
    pub write_timeout: Duration,
    /// Handed to the logging backend when the client is created
    pub log_file: Option<PathBuf>,
    pub routing: RoutingConfig,
}

impl ClientConfig {
    pub fn new(identity: DeviceIdentity, routing: RoutingConfig) -> Self {
        Self {
            identity,
            read_timeout: Duration::ZERO,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            log_file: None,
            routing,
        }
    }

    /// A client for the milk meter's MMP and BCP services
    pub fn milk_meter(identity: DeviceIdentity) -> Self {
        Self::new(identity, RoutingConfig::milk_meter())
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout.is_zero() {
            return Err(Error::Configuration(
                "connection timeout must be non-zero".to_string(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::Configuration(
                "write timeout must be non-zero".to_string(),
            ));
        }
        if self.routing.is_empty() {
            return Err(Error::Configuration(
                "routing configuration has no services".to_string(),
            ));
        }
        Ok(())
    }

    fn stream_read_timeout(&self) -> Option<Duration> {
        if self.read_timeout.is_zero() {
            None
        } else {
            Some(self.read_timeout)
        }
    }
}

pub struct Client {
    config: ClientConfig,
    session: DeviceSession,
    stream: ByteStream,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        if let Some(path) = &config.log_file {
            if !logging::init(Some(path.as_path()))? {
                debug!("Logger already installed, not redirecting to {}", path.display());
            }
        }

        let session = DeviceSession::new(
            config.identity.clone(),
            transport,
            Arc::new(NotificationQueue::new()),
            config.routing.clone(),
        );
        let stream = ByteStream::new(
            session.clone(),
            config.stream_read_timeout(),
            config.write_timeout,
        );

        Ok(Self {
            config,
            session,
            stream,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn stream(&self) -> &ByteStream {
        &self.stream
    }

    /// Mutable access for `std::io::Read`/`Write` consumers
    pub fn stream_mut(&mut self) -> &mut ByteStream {
        &mut self.stream
    }

    pub fn connect(&self) -> Result<()> {
        self.session.connect(self.config.connection_timeout)
    }

    /// Disconnect and drop anything not yet read. Closing a client that is
    /// not connected is not an error.
    ///
    /// Unread data is dropped even when the transport fails to disconnect;
    /// that failure is returned afterwards.
    pub fn close(&self) -> Result<()> {
        let result = match self.session.disconnect(self.config.connection_timeout) {
            Ok(()) | Err(Error::NotConnected) => Ok(()),
            Err(e) => Err(e),
        };
        // Also discards what a lost link left behind
        self.session
            .queue()
            .end_stream(self.session.identity(), EndReason::Closed);
        self.stream.discard_buffered();
        info!("Closed client for {}", self.session.identity());
        result
    }

    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        self.stream.read(n)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.stream.read_all()
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.stream.write(data)
    }

    pub fn flush(&self) -> Result<()> {
        self.stream.flush()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn discover_services(&self) -> Result<ServiceMap> {
        self.session.service_map()
    }
}
