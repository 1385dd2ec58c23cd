//! Dive computer descriptors and the driver/parser seams.

pub mod descriptor;
pub mod driver;
pub mod parser;

pub use descriptor::{
    default_descriptors, default_name_patterns, Descriptor, DescriptorCatalog, DeviceFamily,
    MatchKind, NamePattern, StaticCatalog,
};
pub use driver::{
    DeviceEvents, DeviceInfo, DeviceOpener, DeviceStatus, DiveDevice, FingerprintLookup,
    IterationControl, OpenDevice, Progress, RecordCallback,
};
pub use parser::{DiveParser, ParsedDive, PassthroughParser};
