//! Error types for the dive-computer-ble crate.

use thiserror::Error;

use crate::device::driver::DeviceStatus;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is off, unauthorized or not supported on this system.
    #[error("Bluetooth link unavailable: {reason}")]
    LinkUnavailable {
        /// Description of why the radio cannot be used.
        reason: String,
    },

    /// The identity does not resolve to a reachable candidate.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// No usable write/notify characteristic pair could be set up.
    #[error("Characteristic negotiation failed: {reason}")]
    NegotiationFailed {
        /// Description of what went wrong during negotiation.
        reason: String,
    },

    /// Failed to establish a connection to the dive computer.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The protocol driver refused to open the device.
    #[error("Failed to open device: {status}")]
    DeviceOpenFailed {
        /// Status reported by the driver.
        status: DeviceStatus,
    },

    /// The record enumeration returned a non-success status.
    #[error("Dive enumeration failed: {status}")]
    EnumerationFailed {
        /// Status reported by the driver.
        status: DeviceStatus,
    },

    /// A record's bytes could not be decoded.
    #[error("Failed to parse dive #{dive}: {reason}")]
    ParseFailed {
        /// 1-based number of the dive that failed.
        dive: u32,
        /// Parser message.
        reason: String,
    },

    /// Operation attempted without a ready session and open device.
    #[error("No dive computer connected")]
    NoDeviceConnected,

    /// An operation did not complete in time.
    #[error("Timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Persistent storage could not be read or written.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", err))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
