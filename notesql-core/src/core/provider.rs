//! Capability interface over the database driver.
//!
//! [`crate::SqlService`] only talks to the database through these two traits;
//! [`crate::SqliteProvider`] is the production implementation.

use crate::{NotesqlError, Params, Result, Row, RowMode, RunResult, Value};
use std::path::Path;

/// Message SQLite drivers use when a statement runs after the connection closed.
pub const CONNECTION_NOT_OPEN_MESSAGE: &str = "The database connection is not open";

/// Lazy, single-pass stream of rows backed by a driver cursor.
pub type RowIter = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// A compiled statement. Its [`RowMode`] is fixed at preparation time.
pub trait PreparedStatement: Send + Sync {
    fn sql(&self) -> &str;

    fn mode(&self) -> RowMode;

    /// Executes for side effects.
    fn run(&self, params: &Params) -> Result<RunResult>;

    /// Returns the first row, if any.
    fn get(&self, params: &Params) -> Result<Option<Row>>;

    fn all(&self, params: &Params) -> Result<Vec<Row>>;

    /// Opens a streaming cursor. Nothing is buffered beyond what the
    /// implementation needs to hand rows across.
    fn iterate(&self, params: &Params) -> Result<RowIter>;

    /// First column of the first row.
    fn pluck_get(&self, params: &Params) -> Result<Option<Value>> {
        Ok(self
            .get(params)?
            .and_then(|row| row.into_values().into_iter().next()))
    }

    /// First column of every row.
    fn pluck_all(&self, params: &Params) -> Result<Vec<Value>> {
        Ok(self
            .all(params)?
            .into_iter()
            .filter_map(|row| row.into_values().into_iter().next())
            .collect())
    }
}

/// A database connection as seen by [`crate::SqlService`].
pub trait DatabaseProvider: Send + Sync {
    type Statement: PreparedStatement;

    fn prepare(&self, sql: &str, mode: RowMode) -> Result<Self::Statement>;

    /// Runs an unparameterized, possibly multi-statement script.
    fn exec(&self, script: &str) -> Result<()>;

    /// Runs `f` in a transaction. Calls made from inside `f` on the same thread
    /// nest as savepoints; only the outermost call commits. Other threads wait
    /// until the outermost call ends.
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>;

    /// `true` while the calling thread is inside a transaction it started.
    fn in_transaction(&self) -> bool;

    /// Copies the whole database to `target`.
    fn backup(&self, target: &Path) -> Result<()>;

    /// Classifies an error as "the connection is already closed".
    ///
    /// The default matches on the driver's message text. Providers with a
    /// structured signal should override it.
    fn is_connection_closed(&self, err: &NotesqlError) -> bool {
        match err {
            NotesqlError::ConnectionClosed(_) => true,
            other => other.to_string().contains(CONNECTION_NOT_OPEN_MESSAGE),
        }
    }
}
