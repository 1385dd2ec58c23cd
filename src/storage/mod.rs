//! Persistence of fingerprints and remembered devices.

pub mod backend;
pub mod devices;
pub mod fingerprints;

pub use backend::{FileBackend, KeyValueBackend, MemoryBackend};
pub use devices::{DeviceStore, StoredDevice};
pub use fingerprints::{FingerprintEntry, FingerprintStore};
