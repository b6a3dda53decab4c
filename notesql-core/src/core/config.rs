//! Tunables for [`crate::SqlService`].
//!
//! Loaded from a camelCase JSON file; every field has a default, so a partial
//! or missing file is fine.

use crate::{NotesqlError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Settings for one [`crate::SqlService`] instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqlConfig {
    /// Rejects `UPDATE`/`INSERT`/`DELETE` statements issued through `execute`.
    pub read_only: bool,
    /// Maximum number of values bound per chunk by `get_many_rows`/`execute_many`.
    pub param_limit: usize,
    /// Maximum number of ids written by one `fill_param_list` INSERT.
    pub param_list_batch: usize,
    /// Queries at or above this duration are logged as slow.
    pub slow_query_threshold_ms: u64,
    /// Side table loaded by `fill_param_list`.
    pub param_list_table: String,
    /// Capacity of the driver's compiled-statement cache.
    pub statement_cache_capacity: usize,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            param_limit: 100,
            param_list_batch: 30_000,
            slow_query_threshold_ms: 20,
            param_list_table: "param_list".to_string(),
            statement_cache_capacity: 256,
        }
    }
}

impl SqlConfig {
    /// A default configuration with `read_only` set.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SqlConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration at `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::from_json_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.param_limit == 0 {
            return Err(NotesqlError::InvalidConfig("paramLimit must be positive".into()));
        }
        if self.param_list_batch == 0 {
            return Err(NotesqlError::InvalidConfig(
                "paramListBatch must be positive".into(),
            ));
        }
        if self.param_list_table.trim().is_empty() {
            return Err(NotesqlError::InvalidConfig(
                "paramListTable must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = SqlConfig::default();
        assert!(!config.read_only);
        assert_eq!(config.param_limit, 100);
        assert_eq!(config.param_list_batch, 30_000);
        assert_eq!(config.slow_query_threshold(), Duration::from_millis(20));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SqlConfig::from_json_str(r#"{"readOnly": true, "paramLimit": 50}"#).unwrap();
        assert!(config.read_only);
        assert_eq!(config.param_limit, 50);
        assert_eq!(config.param_list_table, "param_list");
    }

    #[test]
    fn test_zero_limit_rejected() {
        let result = SqlConfig::from_json_str(r#"{"paramLimit": 0}"#);
        assert!(matches!(result, Err(NotesqlError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqlConfig::load(dir.path().join("sql.json")).unwrap();
        assert_eq!(config, SqlConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), r#"{"slowQueryThresholdMs": 5}"#).unwrap();
        let config = SqlConfig::load(temp.path()).unwrap();
        assert_eq!(config.slow_query_threshold(), Duration::from_millis(5));
    }
}
