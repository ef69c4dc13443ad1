//! gattlink - a BLE GATT central-role client core
//!
//! This library connects to BLE peripherals, discovers their services and
//! presents the notifications of one or more logical services as a blocking
//! byte stream. The radio itself sits behind the [`transport::Transport`]
//! trait; [`transport::sim::SimTransport`] provides an in-memory one.
//!
//! Notifications flow from the transport's thread through a
//! [`gatt::ServiceRouter`] into a shared [`queue::NotificationQueue`], from
//! which a [`stream::ByteStream`] reads them in arrival order.

pub mod central;
pub mod client;
pub mod error;
pub mod gap;
pub mod gatt;
pub mod logging;
pub mod queue;
pub mod stream;
pub mod transport;
pub mod uuid;

// Re-export common types for convenience
pub use central::Central;
pub use client::{Client, ClientConfig};
pub use error::{Error, Result, TransportError};
pub use gap::{BdAddr, DeviceIdentity, DiscoveredDevice, ScanConfig, Scanner};
pub use gatt::{
    ConnectionState, DeviceSession, RoutingConfig, ServiceBinding, ServiceMap, ServiceRouter,
    ServiceTag, WriteSignature,
};
pub use queue::{NotificationEvent, NotificationQueue};
pub use stream::ByteStream;
pub use transport::Transport;
pub use uuid::Uuid;
