use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed error carried through storage callbacks.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend could not be reached or rejected the query.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Human readable summary.
        message: String,
        /// Backend failure.
        #[source]
        source: BoxError,
    },
    /// A lookup by key found nothing.
    #[error("{entity} `{key}` not found")]
    NotFound {
        /// Kind of row looked up.
        entity: &'static str,
        /// Key that matched nothing.
        key: String,
    },
    /// A write-once field was already set by another writer.
    #[error("{entity} `{key}` was already written")]
    AlreadyWritten {
        /// Kind of row written.
        entity: &'static str,
        /// Key of the row.
        key: String,
    },
    /// Compare-and-swap on a user's rating matched no row.
    #[error("rating of user `{user_id}` changed concurrently (expected {expected})")]
    RatingConflict {
        /// User whose rating moved.
        user_id: String,
        /// Rating read when the match was claimed.
        expected: i64,
    },
    /// The caller of a locked update asked for a rollback.
    #[error("locked update aborted")]
    Aborted(#[source] BoxError),
    /// Stored data could not be decoded.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a not-found error for the given entity kind and key.
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        StorageError::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Whether this error only reports a missing row.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
