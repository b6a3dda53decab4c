//! Core library for notesql, the context-scoped SQL execution layer of a
//! local-first note-taking application.
//!
//! The primary entry point is [`SqlService`], which wraps a
//! [`DatabaseProvider`] (normally [`SqliteProvider`]) with a statement cache,
//! query helpers, chunked `IN (...)` execution, read-only enforcement,
//! slow-query logging and transaction hooks. Per-unit-of-work state lives in
//! the [`context`] module; [`entity_changes`] collects the change IDs that the
//! sync layer ships after a commit.
//!
//! Types are re-exported from their respective sub-modules for convenience;
//! consumers should import from the crate root rather than the `core` module.

pub mod core;

pub use core::{context, entity_changes};

// Re-export commonly used types.
#[doc(inline)]
pub use core::{
    config::SqlConfig,
    error::{NotesqlError, Result},
    provider::{DatabaseProvider, PreparedStatement, RowIter, CONNECTION_NOT_OPEN_MESSAGE},
    record::Record,
    sql::{SqlService, TransactionHooks, MULTI_VALUE_MARKER},
    sqlite::{SqliteProvider, SqliteStatement},
    value::{FromValue, Params, Row, RowMode, RunResult, Value},
};
