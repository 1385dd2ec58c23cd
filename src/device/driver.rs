//! Seam to the native dive-computer protocol driver.
//!
//! A driver opens a device over a [`BleStream`] and walks the records
//! stored on it, newest first, calling back once per record. The walk is
//! blocking and can only be stopped between records.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::ble::stream::BleStream;
use crate::device::descriptor::Descriptor;
use crate::error::{Error, Result};

/// Status codes reported by a protocol driver.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// The operation is not supported by this model.
    #[error("unsupported operation")]
    Unsupported,
    /// The driver was called with invalid arguments.
    #[error("invalid arguments")]
    InvalidArgs,
    /// The driver ran out of memory.
    #[error("out of memory")]
    NoMemory,
    /// No device answered.
    #[error("no device found")]
    NoDevice,
    /// The device refused access.
    #[error("access denied")]
    NoAccess,
    /// Transport failure.
    #[error("I/O error")]
    Io,
    /// The device did not answer in time.
    #[error("timeout")]
    Timeout,
    /// The device sent an unexpected answer.
    #[error("protocol error")]
    Protocol,
    /// Stored data is malformed.
    #[error("data format error")]
    DataFormat,
    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Returned from the per-record callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationControl {
    /// Deliver the next record.
    Continue,
    /// End the walk.
    Stop,
}

/// Per-record callback: `(record bytes, record fingerprint)`.
pub type RecordCallback<'a> = dyn FnMut(&[u8], &[u8]) -> IterationControl + 'a;

/// An open dive computer.
pub trait DiveDevice: Send {
    /// Set the fingerprint at which the driver stops on its own.
    ///
    /// An empty slice clears it.
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> std::result::Result<(), DeviceStatus>;

    /// Walk stored records, newest first.
    fn foreach(&mut self, callback: &mut RecordCallback<'_>)
        -> std::result::Result<(), DeviceStatus>;

    /// Release the device.
    fn close(self: Box<Self>) -> std::result::Result<(), DeviceStatus>;
}

/// Opens devices for a descriptor.
pub trait DeviceOpener: Send + Sync {
    /// Open the device reachable through `stream`.
    fn open(
        &self,
        descriptor: &Descriptor,
        stream: BleStream,
        events: Arc<DeviceEvents>,
    ) -> std::result::Result<Box<dyn DiveDevice>, DeviceStatus>;
}

/// Identification reported by a device after it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Model number.
    pub model: u32,
    /// Firmware version.
    pub firmware: u32,
    /// Serial number.
    pub serial: u32,
}

impl DeviceInfo {
    /// Serial number as eight lowercase hex digits.
    pub fn serial_string(&self) -> String {
        format!("{:08x}", self.serial)
    }
}

/// Download progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Units transferred so far.
    pub current: u32,
    /// Total units expected.
    pub maximum: u32,
}

impl Progress {
    /// Completed fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.maximum == 0 {
            0.0
        } else {
            (self.current as f64 / self.maximum as f64).min(1.0)
        }
    }
}

/// Looks up a stored fingerprint for `(model, serial)`.
pub type FingerprintLookup = Box<dyn Fn(&str, &str) -> Option<Vec<u8>> + Send + Sync>;

/// Events a driver reports while a device is open.
///
/// Shared between the driver thread and observers, so progress can be
/// polled while a walk holds the device.
pub struct DeviceEvents {
    model: String,
    progress: Mutex<Progress>,
    info: RwLock<Option<DeviceInfo>>,
    fingerprint_lookup: RwLock<Option<FingerprintLookup>>,
}

impl fmt::Debug for DeviceEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEvents")
            .field("model", &self.model)
            .field("progress", &*self.progress.lock())
            .field("info", &*self.info.read())
            .finish()
    }
}

impl DeviceEvents {
    /// Create the event sink for a device described by `descriptor`.
    pub fn new(descriptor: &Descriptor) -> Self {
        Self {
            model: descriptor.display_name(),
            progress: Mutex::new(Progress::default()),
            info: RwLock::new(None),
            fingerprint_lookup: RwLock::new(None),
        }
    }

    /// "Vendor Product" of the open device.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Record download progress.
    pub fn report_progress(&self, current: u32, maximum: u32) {
        *self.progress.lock() = Progress { current, maximum };
    }

    /// Latest progress counters.
    pub fn progress(&self) -> Progress {
        *self.progress.lock()
    }

    /// Record device identification.
    ///
    /// Returns the stored fingerprint for this device when a lookup is
    /// installed and finds one; the driver applies it as its stop point.
    pub fn report_devinfo(&self, info: DeviceInfo) -> Option<Vec<u8>> {
        info!(
            "Device info: model {} firmware {} serial {}",
            info.model,
            info.firmware,
            info.serial_string()
        );
        *self.info.write() = Some(info);

        let lookup = self.fingerprint_lookup.read();
        let fingerprint = lookup
            .as_ref()
            .and_then(|lookup| lookup(&self.model, &info.serial_string()));
        if let Some(fp) = &fingerprint {
            debug!("Stored fingerprint {} for {}", hex::encode(fp), self.model);
        }
        fingerprint
    }

    /// Identification, once the device reported it.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        *self.info.read()
    }

    /// Serial string, once the device reported it.
    pub fn serial(&self) -> Option<String> {
        self.device_info().map(|info| info.serial_string())
    }

    /// Install or remove the fingerprint lookup used on device info.
    pub fn set_fingerprint_lookup(&self, lookup: Option<FingerprintLookup>) {
        *self.fingerprint_lookup.write() = lookup;
    }
}

/// A device opened over a session, with what it was opened as.
pub struct OpenDevice {
    /// Driver handle.
    pub device: Box<dyn DiveDevice>,
    /// Descriptor used to open it.
    pub descriptor: Descriptor,
    /// Event sink shared with the driver.
    pub events: Arc<DeviceEvents>,
}

impl fmt::Debug for OpenDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDevice")
            .field("descriptor", &self.descriptor)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl OpenDevice {
    /// Open a device through `opener`. Blocks on device I/O.
    pub fn open(opener: &dyn DeviceOpener, descriptor: Descriptor, stream: BleStream) -> Result<Self> {
        let events = Arc::new(DeviceEvents::new(&descriptor));
        let device = opener
            .open(&descriptor, stream, events.clone())
            .map_err(|status| Error::DeviceOpenFailed { status })?;

        info!("Opened {}", descriptor.display_name());

        Ok(Self {
            device,
            descriptor,
            events,
        })
    }

    /// Close the driver handle, consuming it.
    pub fn close(self) -> std::result::Result<(), DeviceStatus> {
        debug!("Closing {}", self.descriptor.display_name());
        self.device.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::descriptor::DeviceFamily;
    use pretty_assertions::assert_eq;

    fn descriptor() -> Descriptor {
        Descriptor::new("Shearwater", "Teric", DeviceFamily::ShearwaterPetrel, 8)
    }

    #[test]
    fn test_serial_string_is_zero_padded_hex() {
        let info = DeviceInfo {
            model: 8,
            firmware: 90,
            serial: 0x00ab_12cd,
        };
        assert_eq!(info.serial_string(), "00ab12cd");
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(Progress::default().fraction(), 0.0);
        let half = Progress {
            current: 50,
            maximum: 100,
        };
        assert!((half.fraction() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_devinfo_without_lookup() {
        let events = DeviceEvents::new(&descriptor());
        assert!(events.serial().is_none());

        let found = events.report_devinfo(DeviceInfo {
            model: 8,
            firmware: 1,
            serial: 42,
        });
        assert!(found.is_none());
        assert_eq!(events.serial().as_deref(), Some("0000002a"));
    }

    #[test]
    fn test_devinfo_lookup_receives_model_and_serial() {
        let events = DeviceEvents::new(&descriptor());
        events.set_fingerprint_lookup(Some(Box::new(|model: &str, serial: &str| {
            (model == "Shearwater Teric" && serial == "0000002a").then(|| vec![0xAA, 0xBB])
        })));

        let found = events.report_devinfo(DeviceInfo {
            model: 8,
            firmware: 1,
            serial: 42,
        });
        assert_eq!(found, Some(vec![0xAA, 0xBB]));

        events.set_fingerprint_lookup(None);
        let found = events.report_devinfo(DeviceInfo::default());
        assert!(found.is_none());
    }

    #[test]
    fn test_device_status_display() {
        assert_eq!(DeviceStatus::Io.to_string(), "I/O error");
        assert_eq!(DeviceStatus::Cancelled.to_string(), "cancelled");
    }
}
