//! Pipeline plumbing.
//!
//! Stations run in their own threads behind bounded crossbeam channels; the
//! composer folds settled values and stage results into one snapshot and
//! re-triggers dependent stages from it.

pub mod composer;
pub mod error;
pub mod station;

pub use composer::Composer;
pub use error::{ErrorReporter, LogReporter, RecordingReporter, StationError};
pub use station::{Station, StationRunner};
