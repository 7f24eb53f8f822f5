//! This crate's local error type and its mapping onto
//! [`http_cache_core::CacheError`] (§7).

use http_cache_core::CacheError;
use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef for this crate's backend-internal operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage-backend-local error kinds. These map onto
/// [`CacheError::StorageUnavailable`] and [`CacheError::SerializationError`]
/// at the trait boundary: a backend never returns anything else to the
/// proxy, which degrades to pass-through on the former and soft-deletes on
/// the latter.
#[derive(Error, Diagnostic, Debug)]
pub enum StorageError {
    /// The SQLite connection could not execute a statement.
    #[error("sqlite error: {0}")]
    #[diagnostic(code(http_cache_storage::sqlite))]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking-pool task panicked or was cancelled mid-statement.
    #[error("sqlite worker task failed: {0}")]
    #[diagnostic(code(http_cache_storage::worker))]
    Worker(String),

    /// A stored `data` blob failed to decode, or its header pairs were not
    /// valid HTTP header syntax.
    #[error("corrupt stored entry: {0}")]
    #[diagnostic(code(http_cache_storage::corrupt))]
    Corrupt(String),
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupt(msg) => CacheError::SerializationError(msg),
            other => CacheError::StorageUnavailable(other.to_string()),
        }
    }
}
