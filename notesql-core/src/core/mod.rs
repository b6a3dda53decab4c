//! Internal modules for the notesql core library.
//!
//! All public types from these modules are re-exported at the crate root
//! with `#[doc(inline)]`; import from there in preference to this module.

pub mod config;
pub mod context;
pub mod entity_changes;
pub mod error;
pub mod provider;
pub mod record;
pub mod sql;
pub mod sqlite;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

#[doc(inline)]
pub use config::SqlConfig;
#[doc(inline)]
pub use error::{NotesqlError, Result};
#[doc(inline)]
pub use provider::{DatabaseProvider, PreparedStatement, RowIter};
#[doc(inline)]
pub use record::Record;
#[doc(inline)]
pub use sql::{SqlService, TransactionHooks, MULTI_VALUE_MARKER};
#[doc(inline)]
pub use sqlite::{SqliteProvider, SqliteStatement};
#[doc(inline)]
pub use value::{FromValue, Params, Row, RowMode, RunResult, Value};
