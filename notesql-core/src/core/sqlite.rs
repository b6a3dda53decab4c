//! [`DatabaseProvider`] over a single `rusqlite` connection.

use crate::core::provider::{DatabaseProvider, PreparedStatement, RowIter, CONNECTION_NOT_OPEN_MESSAGE};
use crate::{NotesqlError, Params, Result, Row, RowMode, RunResult, SqlConfig, Value};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, DatabaseName, ToSql};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, ThreadId};

/// Rows a streaming cursor may read ahead of its consumer.
const CURSOR_BUFFER: usize = 64;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
            Value::Boolean(b) => ToSqlOutput::from(i64::from(*b)),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// Which thread owns the open transaction, and how deeply it is nested.
#[derive(Default)]
struct TransactionOwner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// State shared by the provider, its statements and any live cursors.
///
/// The connection mutex serializes single statements. A transaction
/// additionally claims `owner` for its whole duration: statements from other
/// threads wait on `released` until it ends, so they never run inside it.
struct SharedConnection {
    conn: Mutex<Option<Connection>>,
    owner: Mutex<TransactionOwner>,
    released: Condvar,
    /// Threads currently consuming a streaming cursor.
    streaming: Mutex<Vec<ThreadId>>,
}

impl SharedConnection {
    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        self.with_conn_as(thread::current().id(), f)
    }

    /// Runs `f` on behalf of `actor`, the thread whose transaction (if any)
    /// the statement belongs to.
    fn with_conn_as<R>(&self, actor: ThreadId, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let guard = self.acquire(actor)?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| NotesqlError::ConnectionClosed(CONNECTION_NOT_OPEN_MESSAGE.to_string()))?;
        f(conn)
    }

    fn acquire(&self, actor: ThreadId) -> Result<MutexGuard<'_, Option<Connection>>> {
        loop {
            let owner = self.wait_for_owner(actor)?;
            // Taking the connection while `owner` is held keeps a transaction
            // from starting between the check and the statement.
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => drop(owner),
            }
            if self.is_streaming_on_current_thread() {
                return Err(NotesqlError::ConnectionBusy);
            }
            let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
            if owner.thread.map_or(true, |thread| thread == actor) {
                return Ok(guard);
            }
            // A transaction started while we waited; let it finish first.
            drop(guard);
            drop(owner);
        }
    }

    /// Blocks until no other thread owns a transaction. A thread with a live
    /// cursor gets `ConnectionBusy` instead, since the owner may be waiting
    /// for that cursor's producer.
    fn wait_for_owner(&self, actor: ThreadId) -> Result<MutexGuard<'_, TransactionOwner>> {
        let owned_elsewhere =
            |owner: &mut TransactionOwner| owner.thread.is_some_and(|thread| thread != actor);
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if owned_elsewhere(&mut *owner) && self.is_streaming_on_current_thread() {
            return Err(NotesqlError::ConnectionBusy);
        }
        Ok(self
            .released
            .wait_while(owner, owned_elsewhere)
            .unwrap_or_else(PoisonError::into_inner))
    }

    /// Claims the transaction for the current thread and returns the nesting
    /// depth, 1 for the outermost transaction.
    fn enter_transaction(&self) -> Result<usize> {
        let current = thread::current().id();
        let mut owner = self.wait_for_owner(current)?;
        owner.thread = Some(current);
        owner.depth += 1;
        Ok(owner.depth)
    }

    fn leave_transaction(&self) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            self.released.notify_all();
        }
    }

    fn owns_transaction(&self) -> bool {
        let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        owner.thread == Some(thread::current().id())
    }

    fn is_streaming_on_current_thread(&self) -> bool {
        let current = thread::current().id();
        self.streaming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&current)
    }
}

/// SQLite-backed provider. Cheap to share behind an `Arc`; all access to the
/// connection is serialized.
pub struct SqliteProvider {
    shared: Arc<SharedConnection>,
}

impl SqliteProvider {
    /// Opens (or creates) the database file at `path` in WAL journal mode.
    pub fn open<P: AsRef<Path>>(path: P, config: &SqlConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn open_in_memory(config: &SqlConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn from_connection(conn: Connection, config: &SqlConfig) -> Self {
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
        Self {
            shared: Arc::new(SharedConnection {
                conn: Mutex::new(Some(conn)),
                owner: Mutex::default(),
                released: Condvar::new(),
                streaming: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Closes the connection. Every later operation fails with
    /// [`NotesqlError::ConnectionClosed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let conn = self
            .shared
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Ends one level of a transaction: commits on [`commit`](Self::commit),
/// rolls back if dropped first, and releases ownership either way.
struct TransactionGuard<'a> {
    shared: &'a SharedConnection,
    savepoint: Option<String>,
    finished: bool,
}

impl TransactionGuard<'_> {
    fn commit(mut self) -> Result<()> {
        let sql = match &self.savepoint {
            Some(name) => format!("RELEASE {name}"),
            None => "COMMIT".to_string(),
        };
        let result = self.shared.with_conn(|conn| Ok(conn.execute_batch(&sql)?));
        if result.is_err() {
            self.rollback_quietly();
        } else {
            self.finish();
        }
        result
    }

    fn rollback_quietly(&mut self) {
        if self.finished {
            return;
        }
        let sql = match &self.savepoint {
            Some(name) => format!("ROLLBACK TO {name}; RELEASE {name}"),
            None => "ROLLBACK".to_string(),
        };
        if let Err(e) = self.shared.with_conn(|conn| Ok(conn.execute_batch(&sql)?)) {
            log::error!("Rollback failed: {e}");
        }
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.shared.leave_transaction();
        }
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.rollback_quietly();
    }
}

impl DatabaseProvider for SqliteProvider {
    type Statement = SqliteStatement;

    fn prepare(&self, sql: &str, mode: RowMode) -> Result<SqliteStatement> {
        let columns = self.shared.with_conn(|conn| {
            let stmt = conn.prepare_cached(sql)?;
            Ok(stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>())
        })?;
        Ok(SqliteStatement {
            shared: Arc::clone(&self.shared),
            sql: sql.to_string(),
            mode,
            columns: columns.into(),
        })
    }

    fn exec(&self, script: &str) -> Result<()> {
        self.shared.with_conn(|conn| Ok(conn.execute_batch(script)?))
    }

    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let depth = self.shared.enter_transaction()?;
        let savepoint = (depth > 1).then(|| format!("notesql_sp_{}", depth - 1));
        let begin = match &savepoint {
            Some(name) => format!("SAVEPOINT {name}"),
            None => "BEGIN".to_string(),
        };
        if let Err(e) = self.shared.with_conn(|conn| Ok(conn.execute_batch(&begin)?)) {
            self.shared.leave_transaction();
            return Err(e);
        }
        let mut guard = TransactionGuard {
            shared: &self.shared,
            savepoint,
            finished: false,
        };
        match f() {
            Ok(value) => {
                guard.commit()?;
                Ok(value)
            }
            Err(e) => {
                guard.rollback_quietly();
                Err(e)
            }
        }
    }

    /// Whether the calling thread is inside a transaction it started.
    fn in_transaction(&self) -> bool {
        self.shared.owns_transaction()
    }

    fn backup(&self, target: &Path) -> Result<()> {
        self.shared
            .with_conn(|conn| Ok(conn.backup(DatabaseName::Main, target, None)?))
    }

    fn is_connection_closed(&self, err: &NotesqlError) -> bool {
        matches!(err, NotesqlError::ConnectionClosed(_))
    }
}

/// Statement handle returned by [`SqliteProvider::prepare`].
///
/// The compiled statement itself lives in the connection's LRU cache, so a
/// handle stays valid across calls without borrowing the connection.
pub struct SqliteStatement {
    shared: Arc<SharedConnection>,
    sql: String,
    mode: RowMode,
    columns: Arc<[String]>,
}

fn bind(stmt: &mut rusqlite::Statement<'_>, params: &Params) -> Result<()> {
    match params {
        Params::None | Params::Positional(_) => {
            let values: &[Value] = match params {
                Params::Positional(values) => values,
                _ => &[],
            };
            let expected = stmt.parameter_count();
            if values.len() != expected {
                return Err(rusqlite::Error::InvalidParameterCount(values.len(), expected).into());
            }
            for (index, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(index + 1, value)?;
            }
        }
        Params::Named(pairs) => {
            for (name, value) in pairs {
                let index = stmt
                    .parameter_index(name)?
                    .ok_or_else(|| rusqlite::Error::InvalidParameterName(name.clone()))?;
                stmt.raw_bind_parameter(index, value)?;
            }
        }
    }
    Ok(())
}

fn convert_row(row: &rusqlite::Row<'_>, mode: RowMode, columns: &Arc<[String]>) -> Result<Row> {
    let mut values = Vec::with_capacity(columns.len());
    for index in 0..columns.len() {
        values.push(Value::from(row.get_ref(index)?));
    }
    Ok(match mode {
        RowMode::Normal => Row::named(Arc::clone(columns), values),
        RowMode::Raw => Row::raw(values),
    })
}

impl SqliteStatement {
    fn query(&self, params: &Params, limit: Option<usize>) -> Result<Vec<Row>> {
        self.shared.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            bind(&mut stmt, params)?;
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(convert_row(row, self.mode, &self.columns)?);
                if limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
            Ok(out)
        })
    }
}

impl PreparedStatement for SqliteStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn mode(&self) -> RowMode {
        self.mode
    }

    fn run(&self, params: &Params) -> Result<RunResult> {
        self.shared.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            bind(&mut stmt, params)?;
            let changes = stmt.raw_execute()?;
            Ok(RunResult {
                changes,
                last_insert_rowid: conn.last_insert_rowid(),
            })
        })
    }

    fn get(&self, params: &Params) -> Result<Option<Row>> {
        Ok(self.query(params, Some(1))?.into_iter().next())
    }

    fn all(&self, params: &Params) -> Result<Vec<Row>> {
        self.query(params, None)
    }

    fn iterate(&self, params: &Params) -> Result<RowIter> {
        let (tx, rx) = mpsc::sync_channel(CURSOR_BUFFER);
        let registration = StreamingRegistration::new(Arc::clone(&self.shared));
        let actor = registration.thread;
        let shared = Arc::clone(&self.shared);
        let sql = self.sql.clone();
        let mode = self.mode;
        let columns = Arc::clone(&self.columns);
        let params = params.clone();

        thread::Builder::new()
            .name("notesql-cursor".to_string())
            .spawn(move || {
                let produced = shared.with_conn_as(actor, |conn| {
                    let mut stmt = conn.prepare_cached(&sql)?;
                    bind(&mut stmt, &params)?;
                    let mut rows = stmt.raw_query();
                    while let Some(row) = rows.next()? {
                        if tx.send(Ok(convert_row(row, mode, &columns)?)).is_err() {
                            // Consumer went away.
                            break;
                        }
                    }
                    Ok(())
                });
                if let Err(e) = produced {
                    let _ = tx.send(Err(e));
                }
            })?;

        Ok(Box::new(RowCursor {
            rx,
            registration,
        }))
    }
}

/// Marks the thread consuming a cursor until dropped. The mark moves with
/// the cursor when it is read from another thread.
struct StreamingRegistration {
    shared: Arc<SharedConnection>,
    thread: ThreadId,
}

impl StreamingRegistration {
    fn new(shared: Arc<SharedConnection>) -> Self {
        let thread = thread::current().id();
        shared
            .streaming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(thread);
        Self { shared, thread }
    }

    fn follow_current_thread(&mut self) {
        let current = thread::current().id();
        if current == self.thread {
            return;
        }
        let mut streaming = self
            .shared
            .streaming
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = streaming.iter().position(|t| *t == self.thread) {
            streaming.swap_remove(pos);
        }
        streaming.push(current);
        self.thread = current;
    }
}

impl Drop for StreamingRegistration {
    fn drop(&mut self) {
        let mut streaming = self
            .shared
            .streaming
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = streaming.iter().position(|t| *t == self.thread) {
            streaming.swap_remove(pos);
        }
    }
}

struct RowCursor {
    rx: Receiver<Result<Row>>,
    registration: StreamingRegistration,
}

impl Iterator for RowCursor {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.registration.follow_current_thread();
        self.rx.recv().ok()
    }
}
