//! Error types for aggrtail.
//!
//! Uses `thiserror` for library-style error definitions.

use thiserror::Error;

/// Errors that can occur in aggrtail operations.
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding or decoding failed
    #[error("failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Aggregator API returned an error status
    #[error("aggregator API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// A persisted row could not be mapped back to a record
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    /// Event validation failed
    #[error("invalid event: {0}")]
    Validation(String),

    /// Filesystem error while preparing the store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
