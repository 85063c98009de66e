//! Parameter bridging between JSON values and PostgreSQL wire types.

use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::types::{to_sql_checked, IsNull, Kind, ToSql, Type};
use uuid::Uuid;

/// A query parameter carried as JSON until bind time.
///
/// Statements are prepared against the server, which reports the concrete
/// type it inferred for each placeholder. `PgParam` adapts the JSON value
/// to that type when the parameter is serialized: strings become text,
/// uuid, or timestamptz depending on what the statement expects, numbers
/// become the matching integer/float width, and arrays/objects become
/// either a typed array or jsonb.
///
/// Parameters are always sent via the extended query protocol - they are
/// never interpolated into the SQL text.
#[derive(Debug, Clone, PartialEq)]
pub struct PgParam(pub JsonValue);

impl PgParam {
    pub fn null() -> Self {
        Self(JsonValue::Null)
    }
}

impl From<JsonValue> for PgParam {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

fn mismatch(ty: &Type, value: &JsonValue) -> Box<dyn Error + Sync + Send> {
    format!("cannot bind JSON value {value} as postgres type {}", ty.name()).into()
}

impl ToSql for PgParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match &self.0 {
            JsonValue::Null => Ok(IsNull::Yes),
            JsonValue::Bool(b) => b.to_sql(ty, out),
            JsonValue::Number(n) => match ty.name() {
                "int2" => (n.as_i64().ok_or_else(|| mismatch(ty, &self.0))? as i16).to_sql(ty, out),
                "int4" => (n.as_i64().ok_or_else(|| mismatch(ty, &self.0))? as i32).to_sql(ty, out),
                "int8" | "oid" => n
                    .as_i64()
                    .ok_or_else(|| mismatch(ty, &self.0))?
                    .to_sql(&Type::INT8, out),
                "float4" => (n.as_f64().ok_or_else(|| mismatch(ty, &self.0))? as f32)
                    .to_sql(ty, out),
                "float8" => n
                    .as_f64()
                    .ok_or_else(|| mismatch(ty, &self.0))?
                    .to_sql(ty, out),
                "json" | "jsonb" => self.0.to_sql(ty, out),
                "text" | "varchar" => n.to_string().to_sql(ty, out),
                _ => Err(mismatch(ty, &self.0)),
            },
            JsonValue::String(s) => match ty.name() {
                "uuid" => Uuid::parse_str(s)?.to_sql(ty, out),
                "timestamptz" => DateTime::parse_from_rfc3339(s)?
                    .with_timezone(&Utc)
                    .to_sql(ty, out),
                "timestamp" => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")?
                    .to_sql(ty, out),
                "json" | "jsonb" => self.0.to_sql(ty, out),
                _ => s.to_sql(ty, out),
            },
            JsonValue::Array(items) => match ty.kind() {
                Kind::Array(_) => {
                    let elems: Vec<PgParam> =
                        items.iter().cloned().map(PgParam).collect();
                    elems.to_sql(ty, out)
                }
                _ if matches!(ty.name(), "json" | "jsonb") => self.0.to_sql(ty, out),
                _ => Err(mismatch(ty, &self.0)),
            },
            JsonValue::Object(_) => match ty.name() {
                "json" | "jsonb" => self.0.to_sql(ty, out),
                _ => Err(mismatch(ty, &self.0)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Type adaptation happens at bind time; the statement decides.
        true
    }

    to_sql_checked!();
}
