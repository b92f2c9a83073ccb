//! Error types for the journal.

/// Errors produced by journal operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A stored binary key could not be decoded. Indicates on-disk
    /// corruption; never retried.
    #[error("corrupt key: {0}")]
    CorruptKey(String),

    /// A write was rejected before any mutation was applied.
    #[error("invalid write: {0}")]
    Validation(String),

    /// The underlying store failed on a read or write.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored value could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A range scan failed mid-replay. Terminal for the query that issued
    /// it; other queries and the store are unaffected.
    #[error("replay failed: {0}")]
    Replay(String),

    /// A by-tag query was given an offset representation this journal does
    /// not understand. Rejected at query construction.
    #[error("unsupported offset: {0}")]
    UnsupportedOffset(String),

    /// The journal writer task has stopped.
    #[error("journal has shut down")]
    Shutdown,
}

impl From<common::StorageError> for Error {
    fn from(err: common::StorageError) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, Error>;
