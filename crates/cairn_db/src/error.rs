//! Error types for database operations.

use std::path::PathBuf;

/// The standard result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur during database operations.
///
/// `NotFound` and `AlreadyExists` are ordinary outcomes, not failures:
/// a miss or a duplicate write leaves the store unchanged. `Corrupt` is
/// always resolved internally by wiping the affected part back to a valid
/// empty state before it is surfaced, so from the caller's perspective
/// corruption degrades to a cold cache, never to wrong data or a crash.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The key is not present (or its lookup hash matched a different key).
    #[error("key not found")]
    NotFound,

    /// An entry with the same lookup hash already exists; the write was
    /// refused and the existing entry left untouched.
    #[error("an entry with this lookup hash already exists")]
    AlreadyExists,

    /// A structural or checksum inconsistency was detected. The part has
    /// been reset to empty; the failed call cannot be retried but the next
    /// operation will succeed against the fresh state.
    #[error("corrupt part (reset to empty): {reason}")]
    Corrupt {
        /// Description of the detected inconsistency.
        reason: String,
    },

    /// An I/O or lock failure. The part is left alive: no on-disk
    /// inconsistency was introduced, only this call was aborted.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path being operated on when the error occurred.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl DbError {
    /// Creates a `Corrupt` error with the given reason.
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        DbError::Corrupt {
            reason: reason.into(),
        }
    }

    /// Creates an `Io` error for the given path.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DbError::Io {
            path: path.into(),
            source,
        }
    }
}
