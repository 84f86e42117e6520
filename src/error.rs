//! Error types for the migration system
//!
//! Adapter-level errors carry the driver's native message unchanged;
//! the manager prefixes them with the failing migration's identity.

use thiserror::Error;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error taxonomy for migration operations
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    /// An operation was called before `MigrationManager::initialize`
    #[error("migration manager is not initialized; call initialize() first")]
    NotInitialized,

    /// SQL execution failed; wraps the driver's native error text
    #[error("SQL execution failed: {0}")]
    Execution(String),

    /// A stored migration definition could not be read or parsed
    #[error("failed to read migration source: {0}")]
    SourceRead(String),

    /// A migration version collided with an existing one
    #[error("duplicate migration version: {0}")]
    DuplicateVersion(String),

    /// An applied migration's source changed since it was recorded
    #[error("checksum mismatch for migration {version}: recorded {recorded}, current {current}")]
    ChecksumMismatch {
        version: String,
        recorded: String,
        current: String,
    },

    /// Connection string or pool failure
    #[error("database connection error: {0}")]
    Connection(String),

    /// Transaction begin, commit, or rollback failure
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Execution(err.to_string())
    }
}
