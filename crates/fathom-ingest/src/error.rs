//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// HTTP error from the paginated query endpoint.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unrecoverable live transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Record interpretation error.
    #[error("record error: {0}")]
    Record(#[from] fathom_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was attempted on a store that has been closed.
    #[error("data store is closed")]
    StorageClosed,
}
