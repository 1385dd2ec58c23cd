//! Remembered dive computers.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::device::descriptor::DeviceFamily;
use crate::error::Result;
use crate::storage::backend::KeyValueBackend;

/// Storage key of the device list.
pub const STORED_DEVICES_KEY: &str = "stored_devices";

/// A dive computer that was connected before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDevice {
    /// Peer identity (BLE address).
    #[serde(rename = "uuid")]
    pub identity: String,
    /// Advertised name.
    pub name: String,
    /// Protocol family.
    pub family: DeviceFamily,
    /// Numeric model.
    pub model: u32,
    /// Last successful connection.
    pub last_connected: DateTime<Utc>,
}

/// Persistent list of remembered devices, keyed by identity.
pub struct DeviceStore {
    backend: Arc<dyn KeyValueBackend>,
    devices: RwLock<Vec<StoredDevice>>,
}

impl DeviceStore {
    /// Load the store; unreadable data starts an empty list.
    pub fn load(backend: Arc<dyn KeyValueBackend>) -> Self {
        let devices = match backend.read(STORED_DEVICES_KEY) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable device list: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read device list: {}", e);
                Vec::new()
            }
        };

        Self {
            backend,
            devices: RwLock::new(devices),
        }
    }

    /// Remember a device, replacing any earlier record with the same identity.
    pub fn store(
        &self,
        identity: &str,
        name: &str,
        family: DeviceFamily,
        model: u32,
    ) -> Result<StoredDevice> {
        let device = StoredDevice {
            identity: identity.to_string(),
            name: name.to_string(),
            family,
            model,
            last_connected: Utc::now(),
        };

        let mut devices = self.devices.write();
        devices.retain(|d| d.identity != identity);
        devices.push(device.clone());
        self.persist(&devices)?;

        debug!("Remembered {} ({})", name, identity);
        Ok(device)
    }

    /// Look up a device by identity.
    pub fn get(&self, identity: &str) -> Option<StoredDevice> {
        self.devices
            .read()
            .iter()
            .find(|d| d.identity == identity)
            .cloned()
    }

    /// Check if a device is remembered.
    pub fn contains(&self, identity: &str) -> bool {
        self.devices.read().iter().any(|d| d.identity == identity)
    }

    /// Forget a device. Returns whether it was remembered.
    pub fn remove(&self, identity: &str) -> Result<bool> {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|d| d.identity != identity);
        if devices.len() == before {
            return Ok(false);
        }
        self.persist(&devices)?;
        Ok(true)
    }

    /// All remembered devices.
    pub fn list(&self) -> Vec<StoredDevice> {
        self.devices.read().clone()
    }

    /// Replace the whole list.
    pub fn replace_all(&self, devices: Vec<StoredDevice>) -> Result<()> {
        let mut current = self.devices.write();
        self.persist(&devices)?;
        *current = devices;
        Ok(())
    }

    /// The most recently connected device.
    pub fn last_connected(&self) -> Option<StoredDevice> {
        self.devices
            .read()
            .iter()
            .max_by_key(|d| d.last_connected)
            .cloned()
    }

    fn persist(&self, devices: &[StoredDevice]) -> Result<()> {
        let bytes = serde_json::to_vec(devices)?;
        self.backend.write(STORED_DEVICES_KEY, &bytes)
    }
}
