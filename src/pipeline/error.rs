//! Failures inside a station thread and where they end up.
//!
//! A station never hands errors back to its producers. The runner passes
//! them to an [`ErrorReporter`] and then either keeps going or exits,
//! depending on [`StationError::is_fatal`].

use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StationError {
    /// The input was skipped; the station keeps running.
    #[error("recoverable: {0}")]
    Recoverable(String),
    /// The station cannot continue and its runner exits.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StationError::Fatal(_))
    }
}

/// Sink for errors raised on station threads.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, station: &str, error: &StationError);
}

/// Forwards to `tracing`: recoverable errors at warn, fatal ones at error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, error: &StationError) {
        if error.is_fatal() {
            tracing::error!(station, %error, "station stopping");
        } else {
            tracing::warn!(station, %error, "station skipped an input");
        }
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, StationError)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// (station name, error) pairs in the order they were reported.
    pub fn reports(&self) -> Vec<(String, StationError)> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, station: &str, error: &StationError) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((station.to_string(), error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_error_display() {
        assert_eq!(
            StationError::Recoverable("output full".to_string()).to_string(),
            "recoverable: output full"
        );
        assert_eq!(
            StationError::Fatal("store torn down".to_string()).to_string(),
            "fatal: store torn down"
        );
    }

    #[test]
    fn test_is_fatal() {
        assert!(StationError::Fatal("x".to_string()).is_fatal());
        assert!(!StationError::Recoverable("x".to_string()).is_fatal());
    }

    #[test]
    fn test_recording_reporter_keeps_order() {
        let reporter = RecordingReporter::new();
        reporter.report("text", &StationError::Recoverable("a".to_string()));
        reporter.report("flag", &StationError::Fatal("b".to_string()));

        let reports = reporter.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "text");
        assert_eq!(reports[1], ("flag".to_string(), StationError::Fatal("b".to_string())));
    }

    #[test]
    fn test_log_reporter_without_subscriber() {
        LogReporter.report("debounce", &StationError::Recoverable("x".to_string()));
        LogReporter.report("debounce", &StationError::Fatal("y".to_string()));
    }
}
