//! Default configuration constants for settle.
//!
//! Shared by the config layer, the replay tool and the reference translation
//! pipeline so the numbers only live in one place.

/// Default quiet period in milliseconds.
///
/// Raw input has to stay unchanged this long before it is published as the
/// settled value. 50ms is roughly where a pause in live text recognition
/// starts to read as "the text stopped changing".
pub const QUIET_PERIOD_MS: i64 = 50;

/// Upper bound for the quiet period in milliseconds.
///
/// Anything longer is almost certainly a unit mistake (seconds written as
/// milliseconds), so configuration rejects it instead of silently stalling.
pub const MAX_QUIET_PERIOD_MS: i64 = 60_000;

/// How often a station runner re-evaluates the pending raw value when no
/// new observation arrives (trailing-edge settlement).
pub const POLL_INTERVAL_MS: u64 = 10;

/// Capacity of the bounded channel in front of a store runner.
pub const CHANNEL_CAPACITY: usize = 256;

/// Frame interval used by `settle replay` to re-deliver the current
/// observation, mimicking a camera analyzer running at ~100 fps.
pub const FRAME_INTERVAL_MS: u64 = 10;

/// Language code returned by language identification when it cannot decide.
pub const UNDETERMINED_LANGUAGE: &str = "und";

/// Default target language for the translation pipeline.
pub const DEFAULT_TARGET_LANGUAGE: &str = "en";
