//! Service router
//!
//! A peer may multiplex several logical services over one link, each with a
//! write characteristic and a notify characteristic. The router tags inbound
//! notifications with their service and picks the write characteristic for
//! outbound payloads by looking at the payload itself.

use crate::error::{Error, Result};
use crate::gap::DeviceIdentity;
use crate::gatt::types::{find_characteristic, ServiceDescriptor};
use crate::queue::{NotificationEvent, NotificationQueue};
use crate::transport::{NotificationCallback, Transport};
use crate::uuid::Uuid;
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub const MMP_WRITE: Uuid = Uuid::from_u128(0x10000000_1000_1000_8000_00805f9baaaa);
pub const MMP_NOTIFY: Uuid = Uuid::from_u128(0x10000000_2000_1000_8000_00805f9baaaa);
pub const BCP_WRITE: Uuid = Uuid::from_u128(0x40000000_1000_1000_8000_00805f9baaaa);
pub const BCP_NOTIFY: Uuid = Uuid::from_u128(0x40000000_2000_1000_8000_00805f9baaaa);

/// Frames starting with this header belong to the BCP service
pub const BCP_WRITE_PREFIX: [u8; 8] = [0x04, 0x0f, 0x00, 0x0d, 0x60, 0x00, 0x00, 0x1f];

/// Name of a logical service, e.g. "MMP"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceTag(Arc<str>);

impl ServiceTag {
    pub fn new(tag: &str) -> Self {
        ServiceTag(Arc::from(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceTag {
    fn from(tag: &str) -> Self {
        ServiceTag::new(tag)
    }
}

impl PartialEq<str> for ServiceTag {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for ServiceTag {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The shape of payloads a service accepts: a byte prefix plus an
/// inclusive length range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSignature {
    prefix: Vec<u8>,
    min_len: usize,
    max_len: Option<usize>,
}

impl WriteSignature {
    /// Accepts any non-empty payload
    pub fn any() -> Self {
        Self {
            prefix: Vec::new(),
            min_len: 1,
            max_len: None,
        }
    }

    /// Payloads starting with `prefix`
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            prefix: prefix.to_vec(),
            min_len: prefix.len().max(1),
            max_len: None,
        }
    }

    pub fn exact_len(len: usize) -> Self {
        Self::len_range(len, len)
    }

    pub fn len_range(min_len: usize, max_len: usize) -> Self {
        Self {
            prefix: Vec::new(),
            min_len,
            max_len: Some(max_len),
        }
    }

    /// Restrict to payloads starting with `prefix`
    pub fn with_prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = prefix.to_vec();
        self
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.min_len
            && self.max_len.map_or(true, |max| data.len() <= max)
            && data.starts_with(&self.prefix)
    }

    /// Whether some payload is accepted by both signatures
    pub fn overlaps(&self, other: &WriteSignature) -> bool {
        let shortest = self
            .min_len
            .max(other.min_len)
            .max(self.prefix.len())
            .max(other.prefix.len());
        let longest = match (self.max_len, other.max_len) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if longest.map_or(false, |longest| longest < shortest) {
            return false;
        }

        let (short, long) = if self.prefix.len() <= other.prefix.len() {
            (&self.prefix, &other.prefix)
        } else {
            (&other.prefix, &self.prefix)
        };
        long.starts_with(short)
    }
}

impl fmt::Display for WriteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.prefix.is_empty() {
            write!(f, "prefix {} ", hex::encode(&self.prefix))?;
        }
        match self.max_len {
            Some(max) if max == self.min_len => write!(f, "len {}", max),
            Some(max) => write!(f, "len {}..={}", self.min_len, max),
            None => write!(f, "len {}..", self.min_len),
        }
    }
}

/// How a binding claims outbound payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRule {
    Matching(WriteSignature),
    /// Takes whatever no signature matches
    Fallback,
}

/// One logical service: its tag, its characteristics and its write rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub tag: ServiceTag,
    pub write: Uuid,
    pub notify: Uuid,
    pub rule: WriteRule,
}

impl ServiceBinding {
    pub fn new(tag: &str, write: Uuid, notify: Uuid) -> Self {
        Self {
            tag: ServiceTag::new(tag),
            write,
            notify,
            rule: WriteRule::Matching(WriteSignature::any()),
        }
    }

    pub fn accepting(mut self, signature: WriteSignature) -> Self {
        self.rule = WriteRule::Matching(signature);
        self
    }

    pub fn as_fallback(mut self) -> Self {
        self.rule = WriteRule::Fallback;
        self
    }
}

/// A validated list of service bindings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingConfig {
    bindings: Vec<ServiceBinding>,
}

impl RoutingConfig {
    pub fn new(bindings: Vec<ServiceBinding>) -> Result<Self> {
        let mut tags = HashSet::new();
        let mut notifies = HashSet::new();
        let mut fallbacks = 0;

        for binding in &bindings {
            if !tags.insert(binding.tag.clone()) {
                return Err(Error::Configuration(format!(
                    "duplicate service tag {}",
                    binding.tag
                )));
            }
            if !notifies.insert(binding.notify) {
                return Err(Error::Configuration(format!(
                    "notify characteristic {} bound twice",
                    binding.notify
                )));
            }
            if binding.rule == WriteRule::Fallback {
                fallbacks += 1;
                if fallbacks > 1 {
                    return Err(Error::Configuration(
                        "more than one fallback service".to_string(),
                    ));
                }
            }
        }

        for (i, a) in bindings.iter().enumerate() {
            for b in &bindings[i + 1..] {
                if let (WriteRule::Matching(sa), WriteRule::Matching(sb)) = (&a.rule, &b.rule) {
                    if sa.overlaps(sb) {
                        return Err(Error::Configuration(format!(
                            "write signatures of {} ({}) and {} ({}) overlap",
                            a.tag, sa, b.tag, sb
                        )));
                    }
                }
            }
        }

        Ok(Self { bindings })
    }

    /// The milk meter's two service groups: BCP frames are recognised by
    /// their header, everything else goes to MMP.
    pub fn milk_meter() -> Self {
        Self {
            bindings: vec![
                ServiceBinding::new("MMP", MMP_WRITE, MMP_NOTIFY).as_fallback(),
                ServiceBinding::new("BCP", BCP_WRITE, BCP_NOTIFY)
                    .accepting(WriteSignature::prefix(&BCP_WRITE_PREFIX)),
            ],
        }
    }

    pub fn bindings(&self) -> &[ServiceBinding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// A binding resolved against a peer's attribute database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub tag: ServiceTag,
    pub write: Uuid,
    pub notify: Uuid,
    pub rule: WriteRule,
}

/// Immutable routing table of one connection
#[derive(Debug)]
pub struct ServiceRouter {
    routes: Vec<ServiceRoute>,
    by_notify: HashMap<Uuid, usize>,
}

impl ServiceRouter {
    /// Resolve `config` against discovered services
    pub fn bind(config: &RoutingConfig, services: &[ServiceDescriptor]) -> Result<Self> {
        let mut routes = Vec::with_capacity(config.bindings.len());
        let mut by_notify = HashMap::new();

        for binding in &config.bindings {
            let write = find_characteristic(services, &binding.write).ok_or_else(|| {
                Error::Discovery(format!(
                    "{}: write characteristic {} not found",
                    binding.tag, binding.write
                ))
            })?;
            if !write.properties.can_write() {
                return Err(Error::Discovery(format!(
                    "{}: characteristic {} is not writable",
                    binding.tag, binding.write
                )));
            }

            let notify = find_characteristic(services, &binding.notify).ok_or_else(|| {
                Error::Discovery(format!(
                    "{}: notify characteristic {} not found",
                    binding.tag, binding.notify
                ))
            })?;
            if !notify.properties.can_notify() {
                return Err(Error::Discovery(format!(
                    "{}: characteristic {} does not notify",
                    binding.tag, binding.notify
                )));
            }

            by_notify.insert(binding.notify, routes.len());
            routes.push(ServiceRoute {
                tag: binding.tag.clone(),
                write: binding.write,
                notify: binding.notify,
                rule: binding.rule.clone(),
            });
        }

        Ok(Self { routes, by_notify })
    }

    /// Pick the service for an outbound payload: the one signature that
    /// matches, otherwise the fallback.
    pub fn route_write(&self, data: &[u8]) -> Result<&ServiceRoute> {
        let mut matching = self.routes.iter().filter(|route| match &route.rule {
            WriteRule::Matching(signature) => signature.matches(data),
            WriteRule::Fallback => false,
        });

        let route = match (matching.next(), matching.next()) {
            (Some(route), None) => route,
            (Some(a), Some(b)) => {
                return Err(Error::Configuration(format!(
                    "payload matches both {} and {}",
                    a.tag, b.tag
                )))
            }
            (None, _) => self
                .routes
                .iter()
                .find(|route| route.rule == WriteRule::Fallback)
                .ok_or_else(|| {
                    Error::Write(format!("no service accepts a {}-byte payload", data.len()))
                })?,
        };

        debug!(
            "Routing {}-byte write to {} ({})",
            data.len(),
            route.tag,
            route.write
        );
        Ok(route)
    }

    pub fn tag_for(&self, notify: &Uuid) -> Option<&ServiceTag> {
        self.by_notify.get(notify).map(|&i| &self.routes[i].tag)
    }

    pub fn write_characteristic(&self, tag: &str) -> Option<Uuid> {
        self.routes
            .iter()
            .find(|route| route.tag == tag)
            .map(|route| route.write)
    }

    pub fn routes(&self) -> &[ServiceRoute] {
        &self.routes
    }

    /// Subscribe every notify characteristic, feeding `queue`. On failure
    /// the subscriptions made so far are released again.
    pub fn subscribe_all(
        &self,
        transport: &dyn Transport,
        identity: &DeviceIdentity,
        queue: &Arc<NotificationQueue>,
    ) -> Result<()> {
        for (done, route) in self.routes.iter().enumerate() {
            let sink = notification_sink(Arc::clone(queue), identity.clone(), route.tag.clone());
            if let Err(e) = transport.subscribe(identity, &route.notify, sink) {
                for subscribed in &self.routes[..done] {
                    let _ = transport.unsubscribe(identity, &subscribed.notify);
                }
                return Err(Error::Connection(format!(
                    "subscribing to {} notifications failed: {}",
                    route.tag, e
                )));
            }
            debug!("Subscribed {} on {} ({})", route.tag, identity, route.notify);
        }
        Ok(())
    }

    /// Release every subscription; failures are only logged
    pub fn unsubscribe_all(&self, transport: &dyn Transport, identity: &DeviceIdentity) {
        for route in &self.routes {
            if let Err(e) = transport.unsubscribe(identity, &route.notify) {
                warn!(
                    "Failed to unsubscribe {} on {}: {}",
                    route.tag, identity, e
                );
            }
        }
    }
}

/// Transport callback that tags payloads and queues them
pub(crate) fn notification_sink(
    queue: Arc<NotificationQueue>,
    device: DeviceIdentity,
    tag: ServiceTag,
) -> NotificationCallback {
    Arc::new(move |characteristic: &Uuid, payload: &[u8]| {
        trace!(
            "{} {} notification: {}",
            device,
            tag,
            hex::encode(payload)
        );
        queue.push(NotificationEvent::new(
            device.clone(),
            tag.clone(),
            *characteristic,
            payload.to_vec(),
        ));
    })
}
