//! Downloaded dive records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::parser::ParsedDive;

/// One dive downloaded from a dive computer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiveLog {
    /// Id assigned on download.
    pub id: Uuid,
    /// 1-based position in this download, newest first.
    pub number: u32,
    /// Device fingerprint of the record.
    #[serde(with = "hex")]
    pub fingerprint: Vec<u8>,
    /// Raw record bytes.
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    /// Decoded summary.
    #[serde(flatten)]
    pub dive: ParsedDive,
}

impl DiveLog {
    /// Wrap a parsed record.
    pub fn new(number: u32, fingerprint: &[u8], data: &[u8], dive: ParsedDive) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            fingerprint: fingerprint.to_vec(),
            data: data.to_vec(),
            dive,
        }
    }

    /// Fingerprint as lowercase hex.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(&self.fingerprint)
    }
}
