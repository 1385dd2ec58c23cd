//! Dive download.
//!
//! [`DiveLogRetriever`] walks the dives on an open device, forwards the new
//! ones and remembers where the walk stopped for next time.

pub mod cancel;
pub mod log;
pub mod retriever;

pub use cancel::CancellationToken;
pub use log::DiveLog;
pub use retriever::{
    DiveLogRetriever, RetrievalConfig, RetrievalEvent, RetrievalOutcome, RetrievalRequest,
};
