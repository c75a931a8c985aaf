//! Error types for settle.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettleError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Runtime errors
    #[error("No async runtime available: {message}")]
    NoRuntime { message: String },

    #[error("Pipeline has been torn down")]
    TornDown,

    #[error("Store thread failed: {0}")]
    StoreThread(String),

    // Replay log errors
    #[error("Replay log line {line}: {message}")]
    ReplayParse { line: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettleError>;
