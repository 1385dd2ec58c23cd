//! Receive buffer between BLE notifications and blocking readers.
//!
//! Notifications append from the async side; the protocol driver drains
//! from a blocking thread with bounded waits. Every operation takes the
//! same lock, so a reader never sees half of an append.

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::ble::uuids::FRAME_DELIMITER;

/// Default slice used while waiting for data.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Thread-safe byte accumulator.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Mutex<BytesMut>,
    data_ready: Condvar,
    delimiter: u8,
    poll_interval: Duration,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Create an empty buffer using the standard frame delimiter.
    pub fn new() -> Self {
        Self::with_delimiter(FRAME_DELIMITER)
    }

    /// Create an empty buffer with a custom frame delimiter.
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self {
            data: Mutex::new(BytesMut::with_capacity(1024)),
            data_ready: Condvar::new(),
            delimiter,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the wait slice used by [`read_partial`](Self::read_partial).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// The configured frame delimiter.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Append bytes to the tail and wake waiting readers.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut data = self.data.lock();
        data.extend_from_slice(bytes);
        trace!("Buffered {} bytes ({} pending)", bytes.len(), data.len());
        drop(data);
        self.data_ready.notify_all();
    }

    /// Read up to `max_bytes` from the head, waiting at most `timeout`.
    ///
    /// Returns `None` when nothing arrived in time. A request for zero
    /// bytes returns an empty chunk immediately.
    pub fn read_partial(&self, max_bytes: usize, timeout: Duration) -> Option<Bytes> {
        if max_bytes == 0 {
            return Some(Bytes::new());
        }

        let deadline = Instant::now() + timeout;
        let mut data = self.data.lock();

        loop {
            if !data.is_empty() {
                let count = max_bytes.min(data.len());
                return Some(data.split_to(count).freeze());
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let slice = self.poll_interval.min(deadline - now);
            self.data_ready.wait_for(&mut data, slice);
        }
    }

    /// Read up to `max_bytes` without waiting.
    pub fn try_read(&self, max_bytes: usize) -> Bytes {
        let mut data = self.data.lock();
        let count = max_bytes.min(data.len());
        data.split_to(count).freeze()
    }

    /// Remove and return the first span enclosed by `delimiter`, inclusive.
    ///
    /// Bytes before the opening delimiter stay in the buffer.
    pub fn extract_frame(&self, delimiter: u8) -> Option<Bytes> {
        let mut data = self.data.lock();

        let start = data.iter().position(|&b| b == delimiter)?;
        let end = start
            + 1
            + data[start + 1..].iter().position(|&b| b == delimiter)?;

        let mut frame = data.split_off(start);
        let rest = frame.split_off(end - start + 1);
        data.unsplit(rest);

        Some(frame.freeze())
    }

    /// Extract a frame using the configured delimiter.
    pub fn next_frame(&self) -> Option<Bytes> {
        self.extract_frame(self.delimiter)
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&self) {
        self.data.lock().clear();
    }
}
