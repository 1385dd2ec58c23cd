//! Last-downloaded fingerprint per device.
//!
//! After a download the fingerprint of the newest dive is stored under the
//! device's normalized type and serial. The next download stops when it
//! reaches that dive again.
//!
//! Device types arrive in different shapes: the advertised name
//! ("Perdix 2 1A2B3C"), the catalog display name ("Shearwater Perdix 2"),
//! or a bare product name. All of them are normalized to the catalog's
//! product name where possible, so they share one entry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::descriptor::DescriptorCatalog;
use crate::error::{Error, Result};
use crate::storage::backend::KeyValueBackend;

/// Storage key of the fingerprint list.
pub const FINGERPRINTS_KEY: &str = "device_fingerprints";

/// One stored fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintEntry {
    /// Entry id.
    pub id: Uuid,
    /// Device type as given when stored.
    pub device_type: String,
    /// Device serial.
    pub serial: String,
    /// Fingerprint of the newest downloaded dive.
    #[serde(with = "hex")]
    pub fingerprint: Vec<u8>,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
}

/// Persistent fingerprint store.
pub struct FingerprintStore {
    backend: Arc<dyn KeyValueBackend>,
    catalog: Arc<dyn DescriptorCatalog>,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FingerprintStore {
    /// Create a store over a backend.
    pub fn new(backend: Arc<dyn KeyValueBackend>, catalog: Arc<dyn DescriptorCatalog>) -> Self {
        Self {
            backend,
            catalog,
            write_lock: Mutex::new(()),
        }
    }

    /// Canonical form of a device type.
    ///
    /// The catalog's product name when the type resolves; otherwise the
    /// last non-numeric word, itself canonicalized through the catalog.
    /// `normalize(normalize(x)) == normalize(x)`.
    pub fn normalize(&self, device_type: &str) -> String {
        if let Some(descriptor) = self.catalog.resolve_by_name(device_type) {
            return descriptor.product;
        }

        let candidate = product_name_heuristic(device_type);
        match self.catalog.resolve_by_name(&candidate) {
            Some(descriptor) => descriptor.product,
            None => candidate,
        }
    }

    /// Newest stored fingerprint for a device.
    ///
    /// Unreadable storage counts as no fingerprint.
    pub fn get(&self, device_type: &str, serial: &str) -> Option<Vec<u8>> {
        let entries = match self.load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring unreadable fingerprint store: {}", e);
                return None;
            }
        };

        let key = self.normalize(device_type);
        let found = entries
            .into_iter()
            .filter(|e| {
                !e.fingerprint.is_empty()
                    && e.serial == serial
                    && self.normalize(&e.device_type) == key
            })
            .max_by_key(|e| e.timestamp)
            .map(|e| e.fingerprint);

        debug!(
            "Fingerprint lookup {} / {}: {}",
            key,
            serial,
            found.as_deref().map(hex::encode).unwrap_or_else(|| "none".to_string())
        );
        found
    }

    /// Store `fingerprint` as the newest dive of a device.
    ///
    /// Replaces every earlier entry for the same normalized type and serial.
    pub fn put(&self, fingerprint: &[u8], device_type: &str, serial: &str) -> Result<()> {
        if fingerprint.is_empty() {
            return Err(Error::InvalidParameter {
                name: "fingerprint".to_string(),
                value: String::new(),
            });
        }

        let _guard = self.write_lock.lock();
        let key = self.normalize(device_type);
        let mut entries = self.load_for_update();

        entries.retain(|e| !(e.serial == serial && self.normalize(&e.device_type) == key));
        entries.push(FingerprintEntry {
            id: Uuid::new_v4(),
            device_type: device_type.to_string(),
            serial: serial.to_string(),
            fingerprint: fingerprint.to_vec(),
            timestamp: Utc::now(),
        });

        self.save(&entries)?;
        info!(
            "Stored fingerprint {} for {} / {}",
            hex::encode(fingerprint),
            key,
            serial
        );
        Ok(())
    }

    /// Forget the fingerprint of one device.
    pub fn clear(&self, device_type: &str, serial: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let key = self.normalize(device_type);
        let mut entries = self.load_for_update();
        entries.retain(|e| !(e.serial == serial && self.normalize(&e.device_type) == key));
        self.save(&entries)
    }

    /// Forget all fingerprints.
    pub fn clear_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.save(&[])
    }

    /// All stored entries.
    pub fn entries(&self) -> Result<Vec<FingerprintEntry>> {
        self.load()
    }

    fn load(&self) -> Result<Vec<FingerprintEntry>> {
        match self.backend.read(FINGERPRINTS_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn load_for_update(&self) -> Vec<FingerprintEntry> {
        self.load().unwrap_or_else(|e| {
            warn!("Replacing unreadable fingerprint store: {}", e);
            Vec::new()
        })
    }

    fn save(&self, entries: &[FingerprintEntry]) -> Result<()> {
        let bytes = serde_json::to_vec(entries)?;
        self.backend.write(FINGERPRINTS_KEY, &bytes)
    }
}

/// Pick the product-like word out of a device name.
///
/// A single word is kept; otherwise the last word that is not purely
/// numeric; otherwise the name unchanged.
fn product_name_heuristic(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    if let [only] = words.as_slice() {
        return only.to_string();
    }

    words
        .iter()
        .rev()
        .find(|word| !word.chars().all(|c| c.is_ascii_digit()))
        .map(|word| word.to_string())
        .unwrap_or_else(|| name.to_string())
}
