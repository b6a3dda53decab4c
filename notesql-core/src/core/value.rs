//! Dynamic SQL values, result rows and statement parameters.

use crate::{NotesqlError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A dynamically-typed SQL value.
///
/// SQLite has no native boolean type; [`Value::Boolean`] is bound as `0`/`1`
/// and never comes back out of the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the value with booleans rewritten to `0`/`1` integers.
    pub fn normalize_boolean(self) -> Value {
        match self {
            Value::Boolean(b) => Value::Integer(i64::from(b)),
            other => other,
        }
    }

    /// Converts the value into its JSON representation.
    ///
    /// Blobs become arrays of byte values; non-finite reals become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Blob(b) => serde_json::Value::from(b.clone()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Real(_) => "REAL",
            Value::Text(_) => "TEXT",
            Value::Blob(_) => "BLOB",
            Value::Boolean(_) => "BOOLEAN",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Conversion from a [`Value`] into a concrete Rust type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn conversion_error(value: &Value, target: &str) -> NotesqlError {
    NotesqlError::Conversion(format!("cannot convert {} to {target}", value.type_name()))
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(i),
            Value::Boolean(b) => Ok(i64::from(b)),
            other => Err(conversion_error(&other, "i64")),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide)
            .map_err(|_| NotesqlError::Conversion(format!("{wide} does not fit in i32")))
    }
}

impl FromValue for usize {
    fn from_value(value: Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        usize::try_from(wide)
            .map_err(|_| NotesqlError::Conversion(format!("{wide} does not fit in usize")))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Real(f) => Ok(f),
            Value::Integer(i) => Ok(i as f64),
            other => Err(conversion_error(&other, "f64")),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(b),
            Value::Integer(i) => Ok(i != 0),
            other => Err(conversion_error(&other, "bool")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(conversion_error(&other, "String")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Blob(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(conversion_error(&other, "Vec<u8>")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Shape of the rows a prepared statement produces.
///
/// The mode is fixed when a statement is prepared, so it is part of the
/// statement cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowMode {
    /// Rows carry their column names.
    Normal,
    /// Rows are positional tuples.
    Raw,
}

/// A single result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Option<Arc<[String]>>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a named-column row. `columns` and `values` must be the same length.
    pub fn named(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns: Some(columns), values }
    }

    /// Creates a positional row without column names.
    pub fn raw(values: Vec<Value>) -> Self {
        Self { columns: None, values }
    }

    pub fn is_raw(&self) -> bool {
        self.columns.is_none()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_names(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Looks a value up by column name. Always `None` for raw rows.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let columns = self.columns.as_ref()?;
        let index = columns.iter().position(|c| c == name)?;
        self.values.get(index)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Builds a JSON object keyed by column name (or `"0"`, `"1"`, … for raw rows).
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.values.len());
        for (index, value) in self.values.iter().enumerate() {
            let key = match &self.columns {
                Some(columns) => columns[index].clone(),
                None => index.to_string(),
            };
            map.insert(key, value.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// Deserializes a named-column row into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`NotesqlError::Conversion`] if a column holds a NaN or
    /// infinite real, which JSON cannot carry.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        if let Some(index) = self
            .values
            .iter()
            .position(|value| matches!(value, Value::Real(f) if !f.is_finite()))
        {
            let column = match &self.columns {
                Some(columns) => columns[index].clone(),
                None => index.to_string(),
            };
            return Err(NotesqlError::Conversion(format!(
                "column {column} holds a non-finite real"
            )));
        }
        Ok(serde_json::from_value(self.to_json())?)
    }
}

/// Parameters bound to a statement execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    /// Bound to `?` placeholders in order.
    Positional(Vec<Value>),
    /// Bound by full placeholder name, prefix included (`:param1`, `@title`).
    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(values) => values.len(),
            Params::Named(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl<V: Into<Value>, const N: usize> From<[V; N]> for Params {
    fn from(values: [V; N]) -> Self {
        Params::positional(values)
    }
}

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}
