//! Utility functions for the dive-computer-ble crate.

use crate::error::{Error, Result};

/// Decode a hex fingerprint supplied by a caller.
///
/// Surrounding whitespace is ignored and an empty string means no
/// fingerprint.
///
/// # Example
///
/// ```
/// use dive_computer_ble::parse_fingerprint_hex;
///
/// assert_eq!(parse_fingerprint_hex("0aFF").unwrap(), Some(vec![0x0a, 0xff]));
/// assert_eq!(parse_fingerprint_hex("  ").unwrap(), None);
/// ```
pub fn parse_fingerprint_hex(hint: &str) -> Result<Option<Vec<u8>>> {
    let hint = hint.trim();
    if hint.is_empty() {
        return Ok(None);
    }

    hex::decode(hint)
        .map(Some)
        .map_err(|_| Error::InvalidParameter {
            name: "fingerprint".to_string(),
            value: hint.to_string(),
        })
}

/// Short hex rendering of a byte slice for log lines.
#[inline]
pub fn hex_preview(bytes: &[u8], max: usize) -> String {
    if bytes.len() <= max {
        hex::encode(bytes)
    } else {
        format!("{}.. ({} bytes)", hex::encode(&bytes[..max]), bytes.len())
    }
}
