//! Error types shared across the rumkit crates.
//!
//! Errors carry:
//! - Stable error codes for machine parsing
//! - Category classification for grouping
//! - Recoverability hints for the agent's own retry decisions
//!
//! None of these errors are ever surfaced to the host application. They
//! terminate in a log line or a `completion(false)` callback inside the
//! pipeline; the types exist so the immediate caller can decide what to do.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for rumkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file or value errors.
    Config,
    /// Local persistence (cache, blob store) errors.
    Storage,
    /// Delivery errors towards the collector.
    Export,
    /// Session bookkeeping errors.
    Session,
    /// Contract violations by a caller.
    Contract,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Export => write!(f, "export"),
            ErrorCategory::Session => write!(f, "session"),
            ErrorCategory::Contract => write!(f, "contract"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for rumkit.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    // Storage errors (20-29)
    #[error("storage error: {0}")]
    Storage(String),

    #[error("stored data is corrupted: {0}")]
    Corrupted(String),

    // Export errors (30-39)
    #[error("transport error: {0}")]
    Transport(String),

    #[error("retry ceiling exceeded for request {request_id}")]
    RetryCeilingExceeded { request_id: String },

    // Session errors (40-49)
    #[error("no session covers timestamp {timestamp}")]
    NoSessionForTimestamp { timestamp: String },

    // Contract errors (50-59)
    #[error("duplicate key: {key}")]
    DuplicateKey { key: String },

    #[error("missing key: {key}")]
    MissingKey { key: String },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Storage errors
    /// - 30-39: Export errors
    /// - 40-49: Session errors
    /// - 50-59: Contract errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidEndpoint(_) => 11,
            Error::Storage(_) => 20,
            Error::Corrupted(_) => 21,
            Error::Transport(_) => 30,
            Error::RetryCeilingExceeded { .. } => 31,
            Error::NoSessionForTimestamp { .. } => 40,
            Error::DuplicateKey { .. } => 50,
            Error::MissingKey { .. } => 51,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidEndpoint(_) => ErrorCategory::Config,
            Error::Storage(_) | Error::Corrupted(_) => ErrorCategory::Storage,
            Error::Transport(_) | Error::RetryCeilingExceeded { .. } => ErrorCategory::Export,
            Error::NoSessionForTimestamp { .. } => ErrorCategory::Session,
            Error::DuplicateKey { .. } | Error::MissingKey { .. } => ErrorCategory::Contract,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether retrying the failed operation can help.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => false,
            Error::InvalidEndpoint(_) => false,

            Error::Storage(_) => true,
            // Treated as empty state by callers
            Error::Corrupted(_) => true,

            Error::Transport(_) => true,
            Error::RetryCeilingExceeded { .. } => false,

            Error::NoSessionForTimestamp { .. } => false,

            Error::DuplicateKey { .. } => false,
            Error::MissingKey { .. } => false,

            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }
}
