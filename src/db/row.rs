//! Row and streaming types for query results.

use std::collections::HashMap;
use std::pin::Pin;

use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::RepoError;

/// A stream of rows from a query result.
///
/// Uses `futures::Stream` for memory-efficient iteration over large result
/// sets. Rows are fetched on-demand, not loaded all at once.
pub type RowStream<'a> = Pin<Box<dyn Stream<Item = Result<Row, RepoError>> + Send + 'a>>;

/// A single row from a query result.
///
/// Contains column values as JSON, with typed extraction via [`Row::get`].
#[derive(Debug, Clone)]
pub struct Row {
    data: HashMap<String, JsonValue>,
}

impl Row {
    /// Creates a new row from a map of column names to values.
    pub fn new(data: HashMap<String, JsonValue>) -> Self {
        Self { data }
    }

    /// Gets a value from the row by column name, deserializing to the
    /// requested type.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not found or if deserialization fails.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, RepoError> {
        self.data
            .get(key)
            .ok_or_else(|| RepoError::decode(key, "column not found"))
            .and_then(|v| {
                serde_json::from_value(v.clone()).map_err(|e| RepoError::decode(key, e))
            })
    }

    /// Gets a value from the row, returning `None` if the key doesn't exist
    /// or holds SQL NULL.
    ///
    /// Still returns an error if the key exists but deserialization fails.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RepoError> {
        match self.data.get(key) {
            Some(v) if v.is_null() => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| RepoError::decode(key, e)),
            None => Ok(None),
        }
    }

    /// Returns the raw JSON value for a column, if it exists.
    pub fn get_raw(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Removes and returns the raw JSON value for a column.
    pub fn take(&mut self, key: &str) -> Option<JsonValue> {
        self.data.remove(key)
    }

    /// Returns all column names in this row.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|s| s.as_str())
    }

    /// Returns the number of columns in this row.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the row and returns the underlying data map.
    pub fn into_inner(self) -> HashMap<String, JsonValue> {
        self.data
    }

    /// Consumes the row and returns it as a JSON object.
    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.data.into_iter().collect())
    }
}

impl From<HashMap<String, JsonValue>> for Row {
    fn from(data: HashMap<String, JsonValue>) -> Self {
        Self::new(data)
    }
}

/// Converts a driver row into our generic [`Row`].
///
/// Column values are mapped to their JSON equivalents by postgres type
/// name; timestamps become RFC 3339 strings so serde-based entity decode
/// round-trips them through chrono.
pub(crate) fn parse_pg_row(pg_row: &tokio_postgres::Row) -> Row {
    let mut data = HashMap::new();

    for (idx, column) in pg_row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = match column.type_().name() {
            "int2" => pg_row
                .try_get::<_, i16>(idx)
                .ok()
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or(JsonValue::Null),
            "int4" => pg_row
                .try_get::<_, i32>(idx)
                .ok()
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or(JsonValue::Null),
            "int8" => pg_row
                .try_get::<_, i64>(idx)
                .ok()
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or(JsonValue::Null),
            "float4" => pg_row
                .try_get::<_, f32>(idx)
                .ok()
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            "float8" => pg_row
                .try_get::<_, f64>(idx)
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            "bool" => pg_row
                .try_get::<_, bool>(idx)
                .ok()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            "text" | "varchar" | "name" | "bpchar" => pg_row
                .try_get::<_, String>(idx)
                .ok()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
            "uuid" => pg_row
                .try_get::<_, uuid::Uuid>(idx)
                .ok()
                .map(|v| JsonValue::String(v.to_string()))
                .unwrap_or(JsonValue::Null),
            "timestamptz" => pg_row
                .try_get::<_, DateTime<Utc>>(idx)
                .ok()
                .map(|v| JsonValue::String(v.to_rfc3339()))
                .unwrap_or(JsonValue::Null),
            "date" => pg_row
                .try_get::<_, NaiveDate>(idx)
                .ok()
                .map(|v| JsonValue::String(v.to_string()))
                .unwrap_or(JsonValue::Null),
            "json" | "jsonb" => pg_row
                .try_get::<_, JsonValue>(idx)
                .ok()
                .unwrap_or(JsonValue::Null),
            "_text" => pg_row
                .try_get::<_, Vec<String>>(idx)
                .ok()
                .map(|v| JsonValue::Array(v.into_iter().map(JsonValue::String).collect()))
                .unwrap_or(JsonValue::Null),
            _ => {
                // Fallback: try as string
                pg_row
                    .try_get::<_, String>(idx)
                    .ok()
                    .map(JsonValue::String)
                    .unwrap_or(JsonValue::Null)
            }
        };

        data.insert(name, value);
    }

    Row::new(data)
}
