//! SQL execution service: statement cache, query helpers, chunked execution,
//! read-only enforcement, slow-query logging and transaction hooks.

use crate::core::context;
use crate::core::entity_changes;
use crate::core::provider::{DatabaseProvider, PreparedStatement};
use crate::{FromValue, NotesqlError, Params, Record, Result, Row, RowMode, RunResult, SqlConfig, Value};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Token that `get_many_rows` and `execute_many` expand into a list of named
/// placeholders, e.g. `SELECT * FROM notes WHERE noteId IN (???)`.
pub const MULTI_VALUE_MARKER: &str = "???";

const RECURSIVE_QUERY_MARKER: &str = "WITH RECURSIVE";

const GUARDED_PREFIXES: [&str; 3] = ["UPDATE", "INSERT", "DELETE"];

type Hook = Box<dyn Fn() + Send + Sync>;

/// Callbacks fired when a transaction started through
/// [`SqlService::transactional`] ends.
pub struct TransactionHooks {
    on_commit: Hook,
    on_rollback: Hook,
}

impl TransactionHooks {
    pub fn new<C, R>(on_commit: C, on_rollback: R) -> Self
    where
        C: Fn() + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        Self {
            on_commit: Box::new(on_commit),
            on_rollback: Box::new(on_rollback),
        }
    }

    pub fn none() -> Self {
        Self::new(|| {}, || {})
    }

    /// Hooks that drain the entity-change accumulator of the current context:
    /// on commit the drained IDs are handed to `consumer`, on rollback they are
    /// discarded.
    pub fn draining<C>(consumer: C) -> Self
    where
        C: Fn(Vec<i64>) + Send + Sync + 'static,
    {
        Self::new(
            move || match entity_changes::get_and_clear_entity_change_ids() {
                Ok(ids) if !ids.is_empty() => consumer(ids),
                Ok(_) | Err(NotesqlError::ContextNotInitialized) => {}
                Err(e) => log::error!("Could not drain entity changes after commit: {e}"),
            },
            || match entity_changes::get_and_clear_entity_change_ids() {
                Ok(ids) if !ids.is_empty() => {
                    log::info!(
                        "Transaction rollback discarded {} entity change(s).",
                        ids.len()
                    );
                }
                Ok(_) | Err(NotesqlError::ContextNotInitialized) => {}
                Err(e) => log::error!("Could not drain entity changes after rollback: {e}"),
            },
        )
    }
}

impl Default for TransactionHooks {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatementKey {
    sql: String,
    mode: RowMode,
}

/// Restores the slow-query suppression flag when dropped.
struct RestoreSlowQueryFlag(bool);

impl Drop for RestoreSlowQueryFlag {
    fn drop(&mut self) {
        if let Err(e) = context::set_slow_query_logging_disabled(self.0) {
            log::error!("Could not restore slow query logging flag: {e}");
        }
    }
}

fn collapse_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The SQL execution service used by the rest of the application.
///
/// One instance owns one provider and its statement cache and is shared by
/// every unit of work; per-unit state lives in the [`context`] module.
pub struct SqlService<P: DatabaseProvider> {
    provider: Arc<P>,
    hooks: TransactionHooks,
    config: SqlConfig,
    statements: Mutex<HashMap<StatementKey, Arc<P::Statement>>>,
}

impl<P: DatabaseProvider> SqlService<P> {
    /// Wraps `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`NotesqlError::InvalidConfig`] if `config` fails validation.
    pub fn new(provider: P, hooks: TransactionHooks, config: SqlConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider: Arc::new(provider),
            hooks,
            config,
            statements: Mutex::new(HashMap::new()),
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &SqlConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Number of statements held by the cache.
    pub fn cached_statement_count(&self) -> usize {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn statement(&self, sql: &str, mode: RowMode) -> Result<Arc<P::Statement>> {
        let key = StatementKey {
            sql: sql.to_string(),
            mode,
        };
        let cached = self
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(stmt) = cached {
            return Ok(stmt);
        }
        // Prepare without the cache lock: it may wait on the connection.
        let stmt = Arc::new(self.provider.prepare(sql, mode)?);
        let mut statements = self
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(statements.entry(key).or_insert(stmt)))
    }

    /// Absorbs a closed-connection error into `Ok(None)`; logs and returns
    /// anything else.
    fn handle_failure<R>(&self, sql: &str, params: &Params, err: NotesqlError) -> Result<Option<R>> {
        if self.provider.is_connection_closed(&err) {
            log::info!("{err}");
            return Ok(None);
        }
        log::error!(
            "Query failed: {err}; SQL: {}; params: {params:?}",
            collapse_whitespace(sql)
        );
        Err(err)
    }

    /// Runs `op` against the cached statement for `(sql, mode)`.
    ///
    /// `Ok(None)` means the connection was already closed.
    fn wrap<R>(
        &self,
        sql: &str,
        mode: RowMode,
        params: &Params,
        op: impl FnOnce(&P::Statement) -> Result<R>,
    ) -> Result<Option<R>> {
        match self.statement(sql, mode) {
            Ok(stmt) => self.wrap_statement(sql, &stmt, params, op),
            Err(e) => self.handle_failure(sql, params, e),
        }
    }

    fn wrap_statement<R>(
        &self,
        sql: &str,
        stmt: &P::Statement,
        params: &Params,
        op: impl FnOnce(&P::Statement) -> Result<R>,
    ) -> Result<Option<R>> {
        let started = Instant::now();
        let value = match op(stmt) {
            Ok(value) => value,
            Err(e) => return self.handle_failure(sql, params, e),
        };
        let elapsed = started.elapsed();
        if elapsed >= self.config.slow_query_threshold()
            && !context::is_slow_query_logging_disabled().unwrap_or(false)
        {
            let ms = elapsed.as_millis();
            if sql.contains(RECURSIVE_QUERY_MARKER) {
                log::debug!("Slow recursive query took {ms}ms.");
            } else {
                log::info!("Slow query took {ms}ms: {}", collapse_whitespace(sql));
            }
        }
        Ok(Some(value))
    }

    fn check_writable(&self, sql: &str) -> Result<()> {
        let trimmed = sql.trim_start();
        if self.config.read_only && GUARDED_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            return Err(NotesqlError::ReadOnlyViolation(trimmed.trim_end().to_string()));
        }
        Ok(())
    }

    /// `None` when the statement was rejected or the connection is closed.
    fn execute_checked(&self, sql: &str, params: &Params) -> Result<Option<RunResult>> {
        if let Err(e) = self.check_writable(sql) {
            log::error!("{e}");
            return Ok(None);
        }
        self.wrap(sql, RowMode::Normal, params, |stmt| stmt.run(params))
    }

    /// Runs a mutating statement.
    ///
    /// In read-only mode statements starting with `UPDATE`, `INSERT` or
    /// `DELETE` are not sent to the database; the rejection is logged and a
    /// zeroed [`RunResult`] is returned.
    pub fn execute(&self, sql: &str, params: impl Into<Params>) -> Result<RunResult> {
        let params = params.into();
        Ok(self.execute_checked(sql, &params)?.unwrap_or_default())
    }

    /// Runs an unparameterized script, e.g. a migration.
    pub fn execute_script(&self, script: &str) -> Result<()> {
        self.provider.exec(script)
    }

    /// Returns the first row, or [`NotesqlError::RowNotFound`].
    pub fn get_row<T: DeserializeOwned>(&self, sql: &str, params: impl Into<Params>) -> Result<T> {
        self.get_row_or_null(sql, params)?
            .ok_or_else(|| NotesqlError::RowNotFound(collapse_whitespace(sql)))
    }

    pub fn get_row_or_null<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<Option<T>> {
        let params = params.into();
        let row = self
            .wrap(sql, RowMode::Normal, &params, |stmt| stmt.get(&params))?
            .flatten();
        row.map(|row| row.deserialize()).transpose()
    }

    pub fn get_rows<T: DeserializeOwned>(&self, sql: &str, params: impl Into<Params>) -> Result<Vec<T>> {
        let params = params.into();
        self.wrap(sql, RowMode::Normal, &params, |stmt| stmt.all(&params))?
            .unwrap_or_default()
            .iter()
            .map(Row::deserialize)
            .collect()
    }

    /// Rows as positional tuples. Cached separately from the named-column form
    /// of the same SQL text.
    pub fn get_raw_rows(&self, sql: &str, params: impl Into<Params>) -> Result<Vec<Vec<Value>>> {
        let params = params.into();
        Ok(self
            .wrap(sql, RowMode::Raw, &params, |stmt| stmt.all(&params))?
            .unwrap_or_default()
            .into_iter()
            .map(Row::into_values)
            .collect())
    }

    /// First column of the first row; `None` when there is no row.
    pub fn get_value<T: FromValue>(&self, sql: &str, params: impl Into<Params>) -> Result<Option<T>> {
        let params = params.into();
        self.wrap(sql, RowMode::Normal, &params, |stmt| stmt.pluck_get(&params))?
            .flatten()
            .map(T::from_value)
            .transpose()
    }

    /// First column of every row.
    pub fn get_column<T: FromValue>(&self, sql: &str, params: impl Into<Params>) -> Result<Vec<T>> {
        let params = params.into();
        self.wrap(sql, RowMode::Normal, &params, |stmt| stmt.pluck_all(&params))?
            .unwrap_or_default()
            .into_iter()
            .map(T::from_value)
            .collect()
    }

    /// Maps the first column of each row to the second. Later rows win on
    /// duplicate keys.
    pub fn get_map<K, V>(&self, sql: &str, params: impl Into<Params>) -> Result<HashMap<K, V>>
    where
        K: FromValue + Eq + Hash,
        V: FromValue,
    {
        let mut map = HashMap::new();
        for row in self.get_raw_rows(sql, params)? {
            let mut values = row.into_iter();
            match (values.next(), values.next()) {
                (Some(key), Some(value)) => {
                    map.insert(K::from_value(key)?, V::from_value(value)?);
                }
                _ => {
                    return Err(NotesqlError::Conversion(
                        "get_map needs at least two columns".to_string(),
                    ))
                }
            }
        }
        Ok(map)
    }

    /// Streams rows lazily from the driver cursor. Single pass; call again to
    /// re-run the query.
    pub fn iterate_rows<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<impl Iterator<Item = Result<T>> + Send> {
        let params = params.into();
        let rows = match self
            .statement(sql, RowMode::Normal)
            .and_then(|stmt| stmt.iterate(&params))
        {
            Ok(rows) => Some(rows),
            Err(e) => self.handle_failure(sql, &params, e)?,
        };
        Ok(rows
            .into_iter()
            .flatten()
            .map(|row| row.and_then(|row| row.deserialize())))
    }

    /// Expands the multi-value marker once per chunk of at most `param_limit`
    /// values. Yields the chunk SQL, its named parameters, and whether the
    /// chunk is full-sized.
    fn chunks<'a>(
        &'a self,
        sql: &'a str,
        values: &'a [Value],
    ) -> impl Iterator<Item = (String, Params, bool)> + 'a {
        let limit = self.config.param_limit;
        values.chunks(limit).map(move |chunk| {
            let names: Vec<String> = (1..=chunk.len()).map(|i| format!(":param{i}")).collect();
            let chunk_sql = sql.replace(MULTI_VALUE_MARKER, &names.join(","));
            let params = Params::Named(names.into_iter().zip(chunk.iter().cloned()).collect());
            (chunk_sql, params, chunk.len() == limit)
        })
    }

    /// Full chunks always produce the same SQL and go through the cache; the
    /// short tail chunk varies run to run and is prepared ad hoc.
    fn run_chunk<R>(
        &self,
        chunk_sql: &str,
        params: &Params,
        full: bool,
        op: impl FnOnce(&P::Statement) -> Result<R>,
    ) -> Result<Option<R>> {
        let stmt = if full {
            self.statement(chunk_sql, RowMode::Normal)
        } else {
            self.provider.prepare(chunk_sql, RowMode::Normal).map(Arc::new)
        };
        match stmt {
            Ok(stmt) => self.wrap_statement(chunk_sql, &stmt, params, op),
            Err(e) => self.handle_failure(chunk_sql, params, e),
        }
    }

    /// Runs a query containing [`MULTI_VALUE_MARKER`] once per chunk of
    /// `params` and concatenates the rows in chunk order.
    pub fn get_many_rows<T, I, V>(&self, sql: &str, params: I) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = params.into_iter().map(Into::into).collect();
        let mut results = Vec::with_capacity(values.len());
        for (chunk_sql, chunk_params, full) in self.chunks(sql, &values) {
            let rows = self
                .run_chunk(&chunk_sql, &chunk_params, full, |stmt| stmt.all(&chunk_params))?
                .unwrap_or_default();
            for row in &rows {
                results.push(row.deserialize()?);
            }
        }
        Ok(results)
    }

    /// Mutating counterpart of [`get_many_rows`](Self::get_many_rows).
    ///
    /// Changes are summed over all chunks; `last_insert_rowid` comes from the
    /// last chunk.
    pub fn execute_many<I, V>(&self, sql: &str, params: I) -> Result<RunResult>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        if let Err(e) = self.check_writable(sql) {
            log::error!("{e}");
            return Ok(RunResult::default());
        }
        let values: Vec<Value> = params.into_iter().map(Into::into).collect();
        let mut total = RunResult::default();
        for (chunk_sql, chunk_params, full) in self.chunks(sql, &values) {
            if let Some(result) =
                self.run_chunk(&chunk_sql, &chunk_params, full, |stmt| stmt.run(&chunk_params))?
            {
                total.changes += result.changes;
                total.last_insert_rowid = result.last_insert_rowid;
            }
        }
        Ok(total)
    }

    /// Inserts `record` into `table` and returns the new rowid.
    ///
    /// An empty record is logged and skipped (`Ok(None)`), as is a statement
    /// rejected by read-only mode.
    pub fn insert(&self, table: &str, record: &Record, replace: bool) -> Result<Option<i64>> {
        if record.is_empty() {
            let e = NotesqlError::MalformedRecord(format!("Can't insert empty object into table {table}"));
            log::error!("{e}");
            return Ok(None);
        }
        let columns = record.columns().collect::<Vec<_>>().join(", ");
        let placeholders = vec!["?"; record.len()].join(", ");
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let sql = format!("{verb} INTO {table} ({columns}) VALUES ({placeholders})");
        let params = Params::Positional(record.values().cloned().collect());
        Ok(self
            .execute_checked(&sql, &params)?
            .map(|result| result.last_insert_rowid))
    }

    pub fn replace(&self, table: &str, record: &Record) -> Result<Option<i64>> {
        self.insert(table, record, true)
    }

    /// Inserts `record`, or updates every one of its columns when a row with
    /// the same `primary_key` exists. Booleans are stored as `0`/`1`.
    pub fn upsert(&self, table: &str, primary_key: &str, record: &Record) -> Result<()> {
        if record.is_empty() {
            let e = NotesqlError::MalformedRecord(format!("Can't upsert empty object into table {table}"));
            log::error!("{e}");
            return Ok(());
        }
        let columns: Vec<&str> = record.columns().collect();
        let placeholders = columns.iter().map(|c| format!("@{c}")).collect::<Vec<_>>();
        let updates = columns
            .iter()
            .map(|c| format!("{c} = @{c}"))
            .collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({primary_key}) DO UPDATE SET {}",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );
        let params = Params::Named(
            record
                .iter()
                .map(|(column, value)| (format!("@{column}"), value.clone().normalize_boolean()))
                .collect(),
        );
        self.execute(&sql, params)?;
        Ok(())
    }

    /// Loads `ids` into the param-list side table for set-membership queries.
    ///
    /// Duplicates are dropped. With `truncate` the table is emptied first. The
    /// side table is scratch space, so read-only mode does not apply to it.
    pub fn fill_param_list<I, S>(&self, ids: I, truncate: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .into_iter()
            .map(Into::into)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let table = &self.config.param_list_table;
        if truncate {
            let sql = format!("DELETE FROM {table}");
            self.wrap(&sql, RowMode::Normal, &Params::None, |stmt| stmt.run(&Params::None))?;
        }

        // Prepared ad hoc and untimed: batch shapes vary and these inserts
        // should never show up as slow queries.
        for batch in ids.chunks(self.config.param_list_batch) {
            let sql = format!("INSERT INTO {table} VALUES {}", vec!["(?)"; batch.len()].join(","));
            let params = Params::positional(batch.iter().cloned());
            let inserted = self
                .provider
                .prepare(&sql, RowMode::Normal)
                .and_then(|stmt| stmt.run(&params));
            if let Err(e) = inserted {
                self.handle_failure::<()>(&sql, &Params::None, e)?;
            }
        }
        Ok(())
    }

    /// Runs `f` in a transaction.
    ///
    /// When `f` succeeds and the outermost transaction actually committed, the
    /// commit hook fires. When `f` fails the error is logged, the rollback hook
    /// fires, and the original error is returned. A panic in `f` rolls back,
    /// fires the rollback hook, and resumes unwinding.
    pub fn transactional<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.provider.transaction(f)));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                log::error!("Transaction rolled back after a panic");
                (self.hooks.on_rollback)();
                panic::resume_unwind(payload);
            }
        };
        match result {
            Ok(value) => {
                if !self.provider.in_transaction() {
                    (self.hooks.on_commit)();
                }
                Ok(value)
            }
            Err(e) => {
                log::error!("Transaction rolled back: {e}");
                (self.hooks.on_rollback)();
                Err(e)
            }
        }
    }

    /// Runs `cb` with slow-query logging suppressed for the current context,
    /// restoring the previous setting however `cb` exits.
    ///
    /// # Errors
    ///
    /// Returns [`NotesqlError::ContextNotInitialized`] outside a context scope,
    /// otherwise whatever `cb` returns.
    pub fn disable_slow_query_logging<T>(&self, cb: impl FnOnce() -> Result<T>) -> Result<T> {
        let previous = context::is_slow_query_logging_disabled()?;
        context::set_slow_query_logging_disabled(true)?;
        let _restore = RestoreSlowQueryFlag(previous);
        cb()
    }
}

impl<P: DatabaseProvider + 'static> SqlService<P> {
    /// Copies the database to `target` on a blocking worker thread.
    pub async fn copy_database(&self, target: impl AsRef<Path>) -> Result<()> {
        let provider = Arc::clone(&self.provider);
        let target = target.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || provider.backup(&target))
            .await
            .map_err(|e| NotesqlError::Driver(format!("Backup task failed: {e}")))?
    }
}
