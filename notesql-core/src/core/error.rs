//! Error types for the notesql core library.

use thiserror::Error;

/// All errors that can occur within the notesql core library.
#[derive(Debug, Error)]
pub enum NotesqlError {
    /// A context operation was attempted outside any `context::init` scope.
    #[error("Execution context is not initialized")]
    ContextNotInitialized,

    /// A mutating statement was issued while the service is read-only.
    #[error("Cannot execute query in read-only mode: {0}")]
    ReadOnlyViolation(String),

    /// An insert or upsert was asked to write a record with no fields.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// The underlying database connection has already been closed.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The connection is held by a live row cursor on the calling thread.
    #[error("The database connection is busy streaming rows on this thread")]
    ConnectionBusy,

    /// A SQLite operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A non-SQLite driver reported a failure.
    #[error("Driver error: {0}")]
    Driver(String),

    /// `get_row` expected a row but the query returned none.
    #[error("Query returned no rows: {0}")]
    RowNotFound(String),

    /// A column value could not be converted to the requested Rust type.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Configuration values were rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An I/O operation on the filesystem failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Context data or a row could not be (de)serialized as JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias that pins the error type to [`NotesqlError`].
pub type Result<T> = std::result::Result<T, NotesqlError>;

impl NotesqlError {
    /// Returns `true` for the kinds that [`crate::SqlService`] absorbs and
    /// reports through a log line and a zero-effect result instead of
    /// returning them to the caller.
    #[must_use]
    pub fn is_locally_handled(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyViolation(_) | Self::MalformedRecord(_) | Self::ConnectionClosed(_)
        )
    }
}
