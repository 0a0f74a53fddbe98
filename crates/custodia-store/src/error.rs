use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// A uniqueness rule rejected the write.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Caller-supplied data was rejected before touching the database.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The record is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Password hashing or hash parsing failed.
    #[error("Password hash error: {0}")]
    PasswordHash(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A shared handle's lock was poisoned by a panicking holder.
    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Whether a rusqlite error is a UNIQUE / constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
