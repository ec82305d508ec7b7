//! Walks the configured filesystem tree, reads DICOM metadata (no pixels),
//! populates the catalog, and decides when a series is "fully read". Per
//! spec.md §4.3.

mod scanner;

pub use scanner::{scan_once, SeriesSnapshot};
