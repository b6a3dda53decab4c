//! Test helpers: a provider that records what reaches the driver, and a
//! logger that captures records emitted on the current thread.

use crate::core::provider::{DatabaseProvider, PreparedStatement, RowIter};
use crate::{NotesqlError, Params, Result, Row, RowMode, RunResult, SqlConfig, SqliteProvider};
use std::cell::RefCell;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};

#[derive(Default)]
pub struct Recorder {
    prepared: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn prepared(&self) -> Vec<String> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executions(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.prepared.lock().unwrap().clear();
        self.executed.lock().unwrap().clear();
    }

    fn record_execution(&self, sql: &str) {
        self.executed.lock().unwrap().push(sql.to_string());
    }
}

/// [`SqliteProvider`] over an in-memory database that records every prepare
/// and statement execution.
pub struct RecordingProvider {
    inner: SqliteProvider,
    pub recorder: Arc<Recorder>,
}

impl RecordingProvider {
    pub fn new(schema: &str) -> Self {
        let inner = SqliteProvider::open_in_memory(&SqlConfig::default()).unwrap();
        inner.exec(schema).unwrap();
        Self {
            inner,
            recorder: Arc::default(),
        }
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

pub struct RecordingStatement {
    inner: <SqliteProvider as DatabaseProvider>::Statement,
    recorder: Arc<Recorder>,
}

impl PreparedStatement for RecordingStatement {
    fn sql(&self) -> &str {
        self.inner.sql()
    }

    fn mode(&self) -> RowMode {
        self.inner.mode()
    }

    fn run(&self, params: &Params) -> Result<RunResult> {
        self.recorder.record_execution(self.sql());
        self.inner.run(params)
    }

    fn get(&self, params: &Params) -> Result<Option<Row>> {
        self.recorder.record_execution(self.sql());
        self.inner.get(params)
    }

    fn all(&self, params: &Params) -> Result<Vec<Row>> {
        self.recorder.record_execution(self.sql());
        self.inner.all(params)
    }

    fn iterate(&self, params: &Params) -> Result<RowIter> {
        self.recorder.record_execution(self.sql());
        self.inner.iterate(params)
    }
}

impl DatabaseProvider for RecordingProvider {
    type Statement = RecordingStatement;

    fn prepare(&self, sql: &str, mode: RowMode) -> Result<RecordingStatement> {
        self.recorder.prepared.lock().unwrap().push(sql.to_string());
        Ok(RecordingStatement {
            inner: self.inner.prepare(sql, mode)?,
            recorder: Arc::clone(&self.recorder),
        })
    }

    fn exec(&self, script: &str) -> Result<()> {
        self.recorder.record_execution(script);
        self.inner.exec(script)
    }

    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.inner.transaction(f)
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn backup(&self, target: &Path) -> Result<()> {
        self.inner.backup(target)
    }

    fn is_connection_closed(&self, err: &NotesqlError) -> bool {
        self.inner.is_connection_closed(err)
    }
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<(log::Level, String)>>> = const { RefCell::new(None) };
}

struct CapturingLogger;

impl log::Log for CapturingLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        CAPTURED.with(|captured| {
            if let Some(records) = captured.borrow_mut().as_mut() {
                records.push((record.level(), record.args().to_string()));
            }
        });
    }

    fn flush(&self) {}
}

static LOGGER: CapturingLogger = CapturingLogger;
static INSTALL: Once = Once::new();

/// Runs `f` and returns the log records it emitted on this thread.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, Vec<(log::Level, String)>) {
    INSTALL.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
    CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
    let value = f();
    let records = CAPTURED
        .with(|captured| captured.borrow_mut().take())
        .unwrap_or_default();
    (value, records)
}
