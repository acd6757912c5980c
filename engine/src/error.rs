//! Error types for the Tether engine.

use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Argument errors - fail immediately, never queued or retried
    #[error("invalid argument name: must be a non-empty string")]
    InvalidName,

    #[error("invalid argument path: {0}")]
    InvalidPath(String),

    #[error("invalid arguments: scalar values cannot be set without a path")]
    ScalarWithoutPath,

    // Offline conditions
    #[error("client offline")]
    ClientOffline,

    #[error("deleting while offline is not supported")]
    OfflineDelete,

    // Server-side denials
    #[error("message denied: {reason}")]
    MessageDenied { reason: String },

    // Terminal-state violation; logged at the call site and absorbed,
    // surfaced only through completions that must resolve somehow
    #[error("record already destroyed")]
    AlreadyDestroyed,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
