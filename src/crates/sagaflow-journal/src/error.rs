//! Error types for journal store operations

use thiserror::Error;

/// Convenience result type using [`JournalError`]
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors surfaced by journal stores (event log, outbox, caches, artifacts)
#[derive(Debug, Error)]
pub enum JournalError {
    /// Optimistic-lock failure: the instance head version moved underneath
    /// the committer. The engine retries the tick after reloading.
    #[error("version conflict for workflow '{workflow_id}': expected head {expected}, found {found}")]
    Conflict {
        workflow_id: String,
        expected: u64,
        found: u64,
    },

    /// A requested record (artifact, snapshot, instance) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary codec failure (snapshot blobs)
    #[error("codec error: {0}")]
    Codec(String),

    /// Backend storage failure (database, filesystem)
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O failure from a filesystem-backed store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,
}

impl From<bincode::Error> for JournalError {
    fn from(err: bincode::Error) -> Self {
        JournalError::Codec(err.to_string())
    }
}
