//! settle - debounced values and single-flight stages for live recognition
//!
//! Turns a jittery stream of recognition results into settled values and
//! gates the expensive work they trigger so only one call runs at a time.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod defaults;
pub mod error;
pub mod flight;
#[cfg(feature = "cli")]
pub mod logging;
pub mod observer;
pub mod pipeline;
pub mod replay;
pub mod translate;

// Stores
pub use debounce::{DebouncedStore, SettledSource, StoreHandle, StorePusher};

// Stages
pub use flight::{
    Admission, Failure, FlightOptions, FlightPhase, KeyedSingleFlight, Operation, OverlapPolicy,
    SingleFlight, StageError, StageResult, operation_fn,
};

// Composition
pub use pipeline::Composer;

// Error handling
pub use error::{Result, SettleError};

// Config
pub use config::Config;

// Station framework (for advanced users)
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::Station;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
