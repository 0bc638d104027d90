//! Error types for ltm-core.

use thiserror::Error;

/// Result type alias using ltm-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during long-term memory operations.
///
/// Only connection-level and caller-error conditions surface through this
/// type. Recoverable conditions (schema fallback, dangling graph branches,
/// cues that match nothing) are handled locally and logged instead.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing store could not be reached or written
    #[error("connection error: {0}")]
    Connection(String),

    /// The stored schema does not match what this implementation expects
    #[error("schema error: {0}")]
    Schema(String),

    /// Error from the underlying relational engine
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Malformed query or cue
    #[error("query error: {0}")]
    Query(String),

    /// Reference to a node or symbol that does not exist
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Malformed clause text passed to the add/export surface
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    /// Create an integrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    /// Create a parse error at a byte offset in the input text.
    pub fn parse(offset: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            message: message.into(),
        }
    }
}
