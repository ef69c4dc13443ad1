//! GATT client-side functionality
//!
//! Sessions manage the link to one peer, the router splits that link into
//! logical services, and the types describe what discovery found.

pub mod router;
pub mod session;
pub mod types;

#[cfg(test)]
mod tests;

pub use router::{
    RoutingConfig, ServiceBinding, ServiceRoute, ServiceRouter, ServiceTag, WriteRule,
    WriteSignature,
};
pub use session::{ConnectionState, DeviceSession};
pub use types::{
    CharacteristicDescriptor, CharacteristicEntry, CharacteristicProperty, ServiceDescriptor,
    ServiceMap,
};
