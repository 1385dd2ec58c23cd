//! Blocking byte stream over a negotiated session.
//!
//! Protocol drivers are synchronous: they write a command and read the
//! answer. [`BleStream`] turns the session's write characteristic and
//! receive buffer into `std::io::Read + Write`. Writes re-enter the tokio
//! runtime with `Handle::block_on`, so a stream must only be used from a
//! blocking thread (for example inside `spawn_blocking`), never from async
//! code.

use btleplug::api::{Characteristic, WriteType};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::trace;

use crate::ble::frame_buffer::{FrameBuffer, DEFAULT_POLL_INTERVAL};
use crate::ble::peripheral::GattPeripheral;

/// Default time a read waits for data.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Synchronous serial channel to a dive computer.
pub struct BleStream {
    peripheral: Arc<dyn GattPeripheral>,
    write_characteristic: Characteristic,
    write_type: WriteType,
    buffer: Arc<FrameBuffer>,
    timeout: Duration,
    runtime: Handle,
}

impl std::fmt::Debug for BleStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleStream")
            .field("peer", &self.peripheral.identifier())
            .field("write_characteristic", &self.write_characteristic.uuid)
            .field("write_type", &self.write_type)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl BleStream {
    pub(crate) fn new(
        peripheral: Arc<dyn GattPeripheral>,
        write_characteristic: Characteristic,
        write_type: WriteType,
        buffer: Arc<FrameBuffer>,
        timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            peripheral,
            write_characteristic,
            write_type,
            buffer,
            timeout,
            runtime,
        }
    }

    /// Current read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change how long reads wait for data.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Bytes received but not yet read.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all received but unread bytes.
    pub fn purge(&self) {
        self.buffer.clear();
    }

    /// Block the calling thread for `duration`.
    pub fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Read one delimited frame, waiting up to the read timeout.
    pub fn read_frame(&self) -> io::Result<Bytes> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                trace!("Read frame of {} bytes", frame.len());
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no complete frame from dive computer",
                ));
            }
            std::thread::sleep(DEFAULT_POLL_INTERVAL);
        }
    }
}

impl io::Read for BleStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self.buffer.read_partial(buf.len(), self.timeout) {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no data from dive computer",
            )),
        }
    }
}

impl io::Write for BleStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        self.runtime
            .block_on(
                self.peripheral
                    .write(&self.write_characteristic, data, self.write_type),
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        trace!("Wrote {} bytes", data.len());
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
