//! BLE communication module.
//!
//! Scanning, characteristic negotiation and the byte transport a dive
//! computer driver runs over.

pub mod characteristics;
pub mod discovery;
pub mod frame_buffer;
pub mod peripheral;
pub mod scanner;
pub mod session;
pub mod stream;
pub mod uuids;

pub use characteristics::{negotiate, CharacteristicPair};
pub use discovery::{DiscoveryRecord, DiscoveryRegistry, Observation};
pub use frame_buffer::FrameBuffer;
pub use peripheral::{GattPeripheral, NotificationStream};
pub use scanner::BleScanner;
pub use session::{DisconnectOrigin, LinkConfig, LinkEvent, LinkSession, LinkState, TransferStats};
pub use stream::BleStream;
pub use uuids::*;
