// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # dive-computer-ble
//!
//! A cross-platform Rust library for downloading dive logs from dive
//! computers over Bluetooth Low Energy.
//!
//! The crate provides the BLE side of a dive log download: it finds dive
//! computers, negotiates the serial characteristics of their GATT services,
//! turns notifications into a blocking byte stream a protocol driver can
//! read, and runs incremental downloads that stop at the newest dive seen
//! last time. Protocol drivers and dive parsers plug in through the
//! [`DeviceOpener`] and [`DiveParser`] traits.
//!
//! ## Features
//!
//! - **Discovery**: Scan for supported dive computers by advertised name
//! - **Characteristic Negotiation**: Pick the write/notify pair of the serial service
//! - **Byte Transport**: Blocking `Read`/`Write` over notifications and writes
//! - **Incremental Download**: Stop at the fingerprint of the last downloaded dive
//! - **Persistence**: Remembered devices and fingerprints as JSON files
//! - **Reconnect**: Automatic reconnect of remembered devices after a link loss
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dive_computer_ble::{
//!     Collaborators, DeviceOpener, DiveComputerManager, ManagerConfig, Result,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn download(opener: Arc<dyn DeviceOpener>) -> Result<()> {
//!     let config = ManagerConfig::default().with_storage_dir("./divelogs");
//!     let manager = DiveComputerManager::initialize(config, Collaborators::new(opener)).await?;
//!
//!     let found = manager.scan().await?;
//!     if let Some(computer) = found.first() {
//!         manager
//!             .connect(&computer.identity, computer.family, Duration::from_secs(30))
//!             .await?;
//!
//!         for dive in manager.download(false, None).await? {
//!             println!("Dive #{}: {:?} m", dive.number, dive.dive.max_depth);
//!         }
//!     }
//!
//!     manager.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod device;
pub mod device_manager;
pub mod download;
pub mod error;
pub mod storage;
pub mod utils;

// Re-exports for convenience
pub use device_manager::{
    CallbackHandle, Collaborators, DiveComputerManager, ManagerConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_SCAN_DURATION,
};
pub use error::{Error, Result};
pub use utils::{hex_preview, parse_fingerprint_hex};

// Re-export commonly used types from submodules
pub use ble::{
    BleStream, DiscoveryRecord, FrameBuffer, GattPeripheral, LinkConfig, LinkSession, LinkState,
};
pub use device::{
    Descriptor, DescriptorCatalog, DeviceEvents, DeviceFamily, DeviceInfo, DeviceOpener,
    DeviceStatus, DiveDevice, DiveParser, IterationControl, ParsedDive, Progress, StaticCatalog,
};
pub use download::{
    CancellationToken, DiveLog, DiveLogRetriever, RetrievalEvent, RetrievalOutcome,
    RetrievalRequest,
};
pub use storage::{DeviceStore, FileBackend, FingerprintStore, KeyValueBackend, MemoryBackend};
