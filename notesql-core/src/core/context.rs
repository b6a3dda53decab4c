//! Execution context: a key/value scope that travels with one unit of work.
//!
//! A scope is opened with [`init`] (synchronous work) or [`scope`] (a future)
//! and is visible to everything that runs inside it, including nested calls.
//! Scopes nest: an inner `init` shadows the outer scope until it returns.
//!
//! The current scope is a tokio task-local, so it survives `.await` points and
//! task migration between worker threads, and two concurrently running tasks
//! never observe each other's values.

use crate::{NotesqlError, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Well-known context keys.
pub mod keys {
    pub const HOISTED_NOTE_ID: &str = "hoistedNoteId";
    pub const COMPONENT_ID: &str = "componentId";
    pub const DISABLE_ENTITY_EVENTS: &str = "disableEntityEvents";
    pub const MIGRATION_RUNNING: &str = "migrationRunning";
    pub const ENTITY_CHANGE_IDS: &str = "entityChangeIds";
    pub const IGNORE_ENTITY_CHANGE_IDS: &str = "ignoreEntityChangeIds";
    pub const DISABLE_SLOW_QUERY_LOGGING: &str = "disableSlowQueryLogging";
}

/// Hoisted note used when the context carries none.
pub const DEFAULT_HOISTED_NOTE_ID: &str = "root";

type Scope = Arc<Mutex<HashMap<String, serde_json::Value>>>;

tokio::task_local! {
    static CONTEXT: Scope;
}

fn with_current<R>(f: impl FnOnce(&mut HashMap<String, serde_json::Value>) -> R) -> Result<R> {
    CONTEXT
        .try_with(|scope| {
            let mut values = scope.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut values)
        })
        .map_err(|_| NotesqlError::ContextNotInitialized)
}

/// Runs `f` inside a fresh context and returns whatever it returns.
///
/// The context is torn down when `f` completes, whether it returns normally
/// or panics.
pub fn init<T>(f: impl FnOnce() -> T) -> T {
    CONTEXT.sync_scope(Scope::default(), f)
}

/// Runs `fut` inside a fresh context. The asynchronous counterpart of [`init`].
pub fn scope<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    CONTEXT.scope(Scope::default(), fut)
}

/// Returns a callable that runs `job` in a fresh context on each invocation,
/// logging instead of propagating any error it returns.
///
/// Intended for timers and background workers that have no caller to report to.
pub fn wrap<F, E>(job: F) -> impl Fn()
where
    F: Fn() -> std::result::Result<(), E>,
    E: std::fmt::Display,
{
    move || {
        if let Err(e) = init(&job) {
            log::error!("Context-wrapped job failed: {e}");
        }
    }
}

/// Returns `true` when called inside an [`init`] or [`scope`] scope.
pub fn is_active() -> bool {
    CONTEXT.try_with(|_| ()).is_ok()
}

/// Reads `key` from the current context.
///
/// `Ok(None)` means the key is unset; a missing context is an error.
pub fn get(key: &str) -> Result<Option<serde_json::Value>> {
    with_current(|values| values.get(key).cloned())
}

/// Reads `key` and deserializes it into `T`.
pub fn get_as<T: DeserializeOwned>(key: &str) -> Result<Option<T>> {
    match get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn set(key: &str, value: impl Into<serde_json::Value>) -> Result<()> {
    with_current(|values| {
        values.insert(key.to_string(), value.into());
    })
}

/// Clears every key of the current context without leaving the scope.
pub fn reset() -> Result<()> {
    with_current(|values| values.clear())
}

fn flag(key: &str) -> Result<bool> {
    Ok(matches!(get(key)?, Some(serde_json::Value::Bool(true))))
}

pub fn hoisted_note_id() -> Result<String> {
    Ok(get_as::<String>(keys::HOISTED_NOTE_ID)?
        .unwrap_or_else(|| DEFAULT_HOISTED_NOTE_ID.to_string()))
}

pub fn component_id() -> Result<Option<String>> {
    get_as(keys::COMPONENT_ID)
}

pub fn disable_entity_events() -> Result<()> {
    set(keys::DISABLE_ENTITY_EVENTS, true)
}

pub fn is_entity_events_disabled() -> Result<bool> {
    flag(keys::DISABLE_ENTITY_EVENTS)
}

pub fn set_migration_running(running: bool) -> Result<()> {
    set(keys::MIGRATION_RUNNING, running)
}

pub fn is_migration_running() -> Result<bool> {
    flag(keys::MIGRATION_RUNNING)
}

pub fn set_slow_query_logging_disabled(disabled: bool) -> Result<()> {
    set(keys::DISABLE_SLOW_QUERY_LOGGING, disabled)
}

pub fn is_slow_query_logging_disabled() -> Result<bool> {
    flag(keys::DISABLE_SLOW_QUERY_LOGGING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_operations_without_context_fail() {
        assert!(!is_active());
        assert!(matches!(get("componentId"), Err(NotesqlError::ContextNotInitialized)));
        assert!(matches!(set("componentId", "x"), Err(NotesqlError::ContextNotInitialized)));
        assert!(matches!(reset(), Err(NotesqlError::ContextNotInitialized)));
    }

    #[test]
    fn test_absent_key_is_not_an_error() {
        init(|| {
            assert!(is_active());
            assert_eq!(get("componentId").unwrap(), None);
        });
    }

    #[test]
    fn test_init_returns_closure_value_and_tears_down() {
        let value = init(|| {
            set(keys::COMPONENT_ID, "tree").unwrap();
            component_id().unwrap()
        });
        assert_eq!(value.as_deref(), Some("tree"));
        assert!(!is_active());
    }

    #[test]
    fn test_nested_scope_shadows_parent() {
        init(|| {
            set(keys::HOISTED_NOTE_ID, "outer").unwrap();
            init(|| {
                assert_eq!(hoisted_note_id().unwrap(), DEFAULT_HOISTED_NOTE_ID);
                set(keys::HOISTED_NOTE_ID, "inner").unwrap();
            });
            assert_eq!(hoisted_note_id().unwrap(), "outer");
        });
    }

    #[test]
    fn test_reset_clears_keys_but_keeps_scope() {
        init(|| {
            set_migration_running(true).unwrap();
            reset().unwrap();
            assert!(is_active());
            assert!(!is_migration_running().unwrap());
        });
    }

    #[test]
    fn test_panic_releases_scope() {
        let result = std::panic::catch_unwind(|| {
            init(|| {
                set(keys::COMPONENT_ID, "x").unwrap();
                panic!("job failed");
            })
        });
        assert!(result.is_err());
        assert!(!is_active());
    }

    #[test]
    fn test_flags_default_to_false() {
        init(|| {
            assert!(!is_entity_events_disabled().unwrap());
            disable_entity_events().unwrap();
            assert!(is_entity_events_disabled().unwrap());
            assert!(!is_slow_query_logging_disabled().unwrap());
        });
    }

    #[test]
    fn test_wrap_runs_each_call_in_fresh_context() {
        let job = wrap(|| -> std::result::Result<(), NotesqlError> {
            assert_eq!(get(keys::COMPONENT_ID)?, None);
            set(keys::COMPONENT_ID, "job")?;
            Err(NotesqlError::Driver("logged, not raised".into()))
        });
        job();
        job();
        assert!(!is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scopes_do_not_share_values() {
        let task = |value: &'static str| {
            tokio::spawn(scope(async move {
                set(keys::COMPONENT_ID, value).unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                component_id().unwrap()
            }))
        };
        let a = task("a");
        let b = task("b");
        assert_eq!(a.await.unwrap().as_deref(), Some("a"));
        assert_eq!(b.await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_sync_init_nested_in_async_scope() {
        scope(async {
            set(keys::COMPONENT_ID, "outer").unwrap();
            tokio::task::yield_now().await;
            let inner = init(|| component_id().unwrap());
            assert_eq!(inner, None);
            assert_eq!(component_id().unwrap().as_deref(), Some("outer"));
        })
        .await;
        assert!(!is_active());
    }

    #[tokio::test]
    async fn test_nested_async_scope_restores_parent() {
        scope(async {
            set(keys::COMPONENT_ID, "outer").unwrap();
            let inner = scope(async {
                tokio::task::yield_now().await;
                set(keys::COMPONENT_ID, "inner").unwrap();
                component_id().unwrap()
            })
            .await;
            assert_eq!(inner.as_deref(), Some("inner"));
            assert_eq!(component_id().unwrap().as_deref(), Some("outer"));
        })
        .await;
    }
}
