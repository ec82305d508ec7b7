//! For matched series: deidentify, bundle+checksum, upload to the remote
//! service, record task id, manage transfer state. Per spec.md §4.5.

mod deidentify;
mod pipeline;

pub use deidentify::{deidentify_series, DeidentifyOutcome, UidMapping};
pub use pipeline::run_export_for_series;
