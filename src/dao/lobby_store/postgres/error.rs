//! Error types shared by the PostgreSQL storage implementation.

use thiserror::Error;

use crate::dao::storage::StorageError;

/// Convenient result alias returning [`PgDaoError`] failures.
pub type PgResult<T> = Result<T, PgDaoError>;

/// Failures that can occur while talking to PostgreSQL.
#[derive(Debug, Error)]
pub enum PgDaoError {
    /// The connection pool could not be established.
    #[error("failed to connect to PostgreSQL")]
    Connect {
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },
    /// Embedded migrations failed to apply.
    #[error("failed to run PostgreSQL migrations")]
    Migrate {
        /// Migrator error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },
    /// A statement failed while performing `operation`.
    #[error("PostgreSQL query failed during {operation}")]
    Query {
        /// Store operation that issued the statement.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },
}

impl PgDaoError {
    pub(super) fn query(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| PgDaoError::Query { operation, source }
    }
}

impl From<PgDaoError> for StorageError {
    fn from(err: PgDaoError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}
