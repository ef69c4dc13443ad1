//! Device discovery
//!
//! A scan listens to advertisements for a bounded time and reports each
//! matching device once, with the metadata of its first sighting.

use super::advertising::{local_name, manufacturer_data, parse_advertising_data};
use super::types::{AdvertisingReport, BdAddr, DeviceIdentity, DiscoveredDevice};
use crate::error::{Error, Result};
use crate::transport::{ScanControl, Transport};
use log::{debug, info};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub timeout: Duration,
    /// End the scan as soon as every target has been seen
    pub stop_when_all_found: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SCAN_TIMEOUT,
            stop_when_all_found: true,
        }
    }
}

impl ScanConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct ScanningGuard<'a>(&'a AtomicBool);

impl Drop for ScanningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scanner {
    transport: Arc<dyn Transport>,
    adapter: Option<String>,
    scanning: AtomicBool,
}

impl Scanner {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            adapter: None,
            scanning: AtomicBool::new(false),
        }
    }

    /// Tag discovered devices with the adapter that saw them
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Scan for `targets`, or for every advertiser if `targets` is empty.
    ///
    /// Finding nothing before the timeout is not an error. A scan already
    /// running on this scanner makes this fail with [`Error::Busy`].
    pub fn scan(
        &self,
        targets: &[DeviceIdentity],
        config: &ScanConfig,
    ) -> Result<Vec<DiscoveredDevice>> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let _scanning = ScanningGuard(&self.scanning);

        let wanted: HashSet<BdAddr> = targets.iter().map(|t| t.address).collect();
        info!(
            "Scanning for {} ({:?})",
            if wanted.is_empty() {
                "any device".to_string()
            } else {
                format!("{} device(s)", wanted.len())
            },
            config.timeout
        );

        let mut found: Vec<DiscoveredDevice> = Vec::new();
        let mut on_report = |report: AdvertisingReport| {
            if !wanted.is_empty() && !wanted.contains(&report.address) {
                return ScanControl::Continue;
            }
            self.record(&mut found, report);

            if config.stop_when_all_found && !wanted.is_empty() && found.len() == wanted.len() {
                ScanControl::Stop
            } else {
                ScanControl::Continue
            }
        };
        self.transport.scan(config.timeout, &mut on_report)?;

        info!("Scan finished, {} device(s) found", found.len());
        Ok(found)
    }

    fn record(&self, found: &mut Vec<DiscoveredDevice>, report: AdvertisingReport) {
        let structures = parse_advertising_data(&report.data);

        if let Some(device) = found
            .iter_mut()
            .find(|d| d.identity.address == report.address)
        {
            // A scan response may carry what the advertisement left out
            if device.local_name.is_none() {
                device.local_name = local_name(&structures);
            }
            if device.manufacturer_data.is_none() {
                device.manufacturer_data = manufacturer_data(&structures);
            }
            return;
        }

        let mut identity = DeviceIdentity::new(report.address);
        identity.adapter = self.adapter.clone();
        let device = DiscoveredDevice {
            identity,
            rssi: report.rssi,
            event_type: report.event_type,
            local_name: local_name(&structures),
            manufacturer_data: manufacturer_data(&structures),
            adv_data: report.data,
        };
        debug!(
            "Found {} rssi {} name {:?} manufacturer data {:?}",
            device.identity,
            device.rssi,
            device.local_name,
            device.manufacturer_data_hex()
        );
        found.push(device);
    }

    /// Scan for devices given as "AA:BB:CC:DD:EE:FF" strings
    pub fn scan_ms(&self, addresses: &[&str], timeout_ms: u64) -> Result<Vec<DiscoveredDevice>> {
        let targets = addresses
            .iter()
            .map(|address| {
                address
                    .parse::<DeviceIdentity>()
                    .map_err(|e| Error::Configuration(format!("{:?}: {}", address, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        let config = ScanConfig::default().with_timeout(Duration::from_millis(timeout_ms));
        self.scan(&targets, &config)
    }
}
