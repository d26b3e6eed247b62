//! Errors of the persistence layer.

/// Errors raised by the state stores.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying SQLite failure
    #[error("state database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Database file was written by an incompatible version
    #[error("state schema version mismatch: found {found}, expected {expected}")]
    SchemaMismatch {
        /// Version found in the file
        found: i64,
        /// Version this build requires
        expected: i64,
    },
    /// State directory could not be created
    #[error("failed to create state directory {0}: {1}")]
    CreateDir(String, String),
    /// Stored value failed to deserialise
    #[error("corrupt state row in {table}: {reason}")]
    Corrupt {
        /// Table holding the row
        table: &'static str,
        /// What was wrong
        reason: String,
    },
}
