//! Typed errors for the storage layer and the indexing pipeline.

use repo_indexer_core::status::{Status, UnknownStatus};
use thiserror::Error;

/// SQLite primary and extended result codes that mean "try again":
/// BUSY, LOCKED, BUSY_RECOVERY, LOCKED_SHAREDCACHE, BUSY_SNAPSHOT, BUSY_TIMEOUT.
const SQLITE_TRANSIENT: &[&str] = &["5", "6", "261", "262", "517", "773"];

/// PostgreSQL serialization failure and deadlock, plus the two connection
/// exceptions raised before a session exists (08001 cannot establish,
/// 08004 rejected by server).
const SQLSTATE_TRANSIENT: &[&str] = &["40001", "40P01", "08001", "08004"];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("repository {id} already registered for {url}")]
    AlreadyExists { id: i64, url: String },

    #[error("repository {id} is already active ({status})")]
    AlreadyActive { id: i64, status: Status },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// The compare-and-swap on a status found a different current value.
    #[error("repository {id} is no longer {expected}")]
    Conflict { id: i64, expected: Status },

    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("vector store error: {0}")]
    VectorStore(anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether retrying the same unit of work can succeed.
    ///
    /// Only lock contention, serialization conflicts and connection
    /// failures raised before a statement was sent qualify. Constraint violations, missing rows, decode errors
    /// and everything raised by application code are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => {
                let code: &str = &code;
                SQLITE_TRANSIENT.contains(&code) || SQLSTATE_TRANSIENT.contains(&code)
            }
            None => false,
        },
        // No connection was handed out, so nothing was sent. An I/O error
        // may have hit after the statement reached the server.
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors that end a pipeline run.
///
/// Per-file problems never surface here; they are logged and counted.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("clone failed: {0}")]
    Clone(String),

    #[error("metadata extraction failed: {0}")]
    Metadata(String),

    #[error("file listing failed: {0}")]
    Listing(String),

    #[error("persisting clone state failed: {0}")]
    PersistClone(#[source] StorageError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("indexing cancelled")]
    Cancelled,
}

impl IndexError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            IndexError::Cancelled | IndexError::Storage(StorageError::Cancelled)
        )
    }

}
