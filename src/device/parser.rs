//! Seam to the dive sample parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::descriptor::Descriptor;
use crate::error::Result;

/// Summary fields decoded from a raw dive record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDive {
    /// Dive start time.
    pub datetime: Option<DateTime<Utc>>,
    /// Maximum depth in meters.
    pub max_depth: Option<f64>,
    /// Dive time in seconds.
    pub duration_seconds: Option<u32>,
    /// Parser-specific fields.
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Turns raw record bytes into a [`ParsedDive`].
#[cfg_attr(test, mockall::automock)]
pub trait DiveParser: Send + Sync {
    /// Parse one record of a device described by `descriptor`.
    fn parse(&self, descriptor: &Descriptor, data: &[u8]) -> Result<ParsedDive>;
}

/// Parser that decodes nothing and records the blob size.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughParser;

impl DiveParser for PassthroughParser {
    fn parse(&self, descriptor: &Descriptor, data: &[u8]) -> Result<ParsedDive> {
        let mut extra = BTreeMap::new();
        extra.insert("size".to_string(), serde_json::Value::from(data.len()));
        extra.insert(
            "model".to_string(),
            serde_json::Value::from(descriptor.display_name()),
        );
        Ok(ParsedDive {
            extra,
            ..ParsedDive::default()
        })
    }
}
