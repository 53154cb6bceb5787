//! Error types shared across Fathom crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while interpreting collection data.
#[derive(Error, Debug)]
pub enum Error {
    /// A `received` ordering token that is not a numeric millisecond string.
    #[error("invalid timestamp token '{token}': {reason}")]
    InvalidTimestamp {
        /// The offending token as it appeared on the wire.
        token: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
