//! Candidate list built from advertisements.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::device::descriptor::{DescriptorCatalog, DeviceFamily};
use crate::storage::devices::DeviceStore;

/// A connectable dive computer seen during a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    /// Peer identity.
    #[serde(rename = "address")]
    pub identity: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Last seen signal strength in dBm.
    pub rssi: Option<i16>,
    /// Resolved protocol family.
    pub family: Option<DeviceFamily>,
}

/// What an advertisement did to the candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A new candidate was added.
    Added,
    /// An existing candidate was refreshed.
    Updated,
    /// The advertisement does not describe a supported device.
    Rejected,
}

/// Deduplicated, ordered list of connectable candidates.
pub struct DiscoveryRegistry {
    records: RwLock<Vec<DiscoveryRecord>>,
    is_scanning: AtomicBool,
    devices: Arc<DeviceStore>,
    catalog: Arc<dyn DescriptorCatalog>,
}

impl DiscoveryRegistry {
    /// Create an empty registry.
    pub fn new(devices: Arc<DeviceStore>, catalog: Arc<dyn DescriptorCatalog>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            is_scanning: AtomicBool::new(false),
            devices,
            catalog,
        }
    }

    /// Process one advertisement.
    ///
    /// Accepted only with a non-empty name that belongs to a remembered
    /// device or resolves through the catalog.
    pub fn observe(&self, identity: &str, name: Option<&str>, rssi: Option<i16>) -> Observation {
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => {
                trace!("Ignoring unnamed peer {}", identity);
                return Observation::Rejected;
            }
        };

        let remembered = self.devices.get(identity);
        let family = match (&remembered, self.catalog.resolve_by_name(name)) {
            (_, Some(descriptor)) => Some(descriptor.family),
            (Some(device), None) => Some(device.family),
            (None, None) => {
                trace!("Ignoring unsupported peer {} ({})", name, identity);
                return Observation::Rejected;
            }
        };

        let mut records = self.records.write();
        if let Some(existing) = records.iter_mut().find(|r| r.identity == identity) {
            if rssi.is_some() {
                existing.rssi = rssi;
            }
            return Observation::Updated;
        }

        info!("Found dive computer {} ({})", name, identity);
        records.push(DiscoveryRecord {
            identity: identity.to_string(),
            name: Some(name.to_string()),
            rssi,
            family,
        });
        Observation::Added
    }

    /// Current candidates in discovery order.
    pub fn records(&self) -> Vec<DiscoveryRecord> {
        self.records.read().clone()
    }

    /// Look up a candidate.
    pub fn get(&self, identity: &str) -> Option<DiscoveryRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.identity == identity)
            .cloned()
    }

    /// Empty the candidate list.
    pub fn clear(&self) {
        debug!("Clearing discovered devices");
        self.records.write().clear();
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    pub(crate) fn set_scanning(&self, scanning: bool) {
        self.is_scanning.store(scanning, Ordering::SeqCst);
    }
}
