//! Native message types and their wire metadata.

pub mod catalog;
pub mod extractions;
pub mod header;
pub mod video;

pub use header::{Header, NativeMessage, Timestamp};
