//! Predicate algebra and its translation to parameterized SQL fragments.
//!
//! Predicates are a closed enum; every operator lowers to a fixed SQL
//! shape with `$N` placeholders, so fragments compose into larger
//! statements without string interpolation of values.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use ulid::Ulid;

use crate::db::PgParam;
use crate::error::RepoError;
use crate::schema::{Cast, TableMeta, Wrap};

/// Comparison operator for a structured predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
    Null,
    NotNull,
    /// JSON containment: column contains the given document (`@>`).
    Contains,
    /// JSON containment: column is contained by the given document (`<@`).
    ContainedBy,
    /// JSON key presence (`?`).
    HasKey,
    /// JSON all-keys presence (`?&`).
    HasKeys,
    /// Timestamp lower bound on a time-ordered (ULID) identifier column.
    TsGte,
    /// Timestamp upper bound on a time-ordered (ULID) identifier column.
    TsLte,
}

/// A filter condition over one entity table.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Structured comparison. Explicit `cast`/`wrap` override the field
    /// metadata defaults.
    Cmp {
        field: String,
        op: Op,
        value: JsonValue,
        cast: Option<Cast>,
        wrap: Option<Wrap>,
    },
    /// Hand-written condition - bypasses casting and wrapping entirely.
    /// Placeholders are written `$1..$k` relative to this fragment and
    /// renumbered during compilation.
    Raw { sql: String, params: Vec<JsonValue> },
}

impl Predicate {
    fn cmp_value(field: impl Into<String>, op: Op, value: JsonValue) -> Self {
        Self::Cmp {
            field: field.into(),
            op,
            value,
            cast: None,
            wrap: None,
        }
    }

    /// `{field, value}` equality shorthand.
    pub fn eq(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::cmp(field, Op::Eq, value)
    }

    /// Structured comparison with an explicit operator.
    pub fn cmp(field: impl Into<String>, op: Op, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).expect("failed to serialize predicate value");
        Self::cmp_value(field, op, value)
    }

    /// Membership in a value list. An empty list compiles to an
    /// unsatisfiable condition.
    pub fn is_in<T: Serialize>(field: impl Into<String>, values: &[T]) -> Self {
        let value = serde_json::to_value(values).expect("failed to serialize predicate values");
        Self::cmp_value(field, Op::In, value)
    }

    pub fn null(field: impl Into<String>) -> Self {
        Self::cmp_value(field, Op::Null, JsonValue::Null)
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Self::cmp_value(field, Op::NotNull, JsonValue::Null)
    }

    /// Rows whose time-ordered identifier embeds a timestamp >= `ts`.
    pub fn ts_gte(field: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self::cmp_value(field, Op::TsGte, JsonValue::String(ts.to_rfc3339()))
    }

    /// Rows whose time-ordered identifier embeds a timestamp <= `ts`.
    pub fn ts_lte(field: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self::cmp_value(field, Op::TsLte, JsonValue::String(ts.to_rfc3339()))
    }

    /// Escape hatch for hand-written conditions.
    pub fn raw(sql: impl Into<String>, params: Vec<JsonValue>) -> Self {
        Self::Raw {
            sql: sql.into(),
            params,
        }
    }

    /// Overrides the metadata cast for this predicate.
    pub fn cast(mut self, cast: Cast) -> Self {
        if let Self::Cmp { cast: c, .. } = &mut self {
            *c = Some(cast);
        }
        self
    }

    /// Overrides the metadata wrap for this predicate.
    pub fn wrap(mut self, wrap: Wrap) -> Self {
        if let Self::Cmp { wrap: w, .. } = &mut self {
            *w = Some(wrap);
        }
        self
    }
}

/// A parameterized piece of a SQL statement, safe to compose.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<PgParam>,
}

impl Fragment {
    /// The always-true fragment - "no filter" is a safe default.
    pub fn tautology() -> Self {
        Self {
            sql: "TRUE".to_string(),
            params: Vec::new(),
        }
    }
}

/// Compiles a predicate sequence (implicit AND) into one fragment.
///
/// `offset` is the number of placeholders already allocated by the
/// enclosing statement; the fragment's placeholders continue from there.
pub fn compile(
    preds: &[Predicate],
    meta: &TableMeta,
    offset: usize,
) -> Result<Fragment, RepoError> {
    if preds.is_empty() {
        return Ok(Fragment::tautology());
    }

    let mut sql_parts = Vec::with_capacity(preds.len());
    let mut params = Vec::new();

    for pred in preds {
        let part = compile_one(pred, meta, offset, &mut params)?;
        sql_parts.push(part);
    }

    Ok(Fragment {
        sql: sql_parts.join(" AND "),
        params,
    })
}

fn compile_one(
    pred: &Predicate,
    meta: &TableMeta,
    offset: usize,
    params: &mut Vec<PgParam>,
) -> Result<String, RepoError> {
    match pred {
        Predicate::Raw { sql, params: raw } => {
            let shifted = shift_placeholders(sql, offset + params.len());
            params.extend(raw.iter().cloned().map(PgParam));
            Ok(format!("({shifted})"))
        }
        Predicate::Cmp {
            field,
            op,
            value,
            cast,
            wrap,
        } => {
            if !meta.has_column(field) {
                return Err(RepoError::config(format!(
                    "unknown column '{field}' on table '{}'",
                    meta.table
                )));
            }
            let cast = cast.or_else(|| meta.cast_for(field));
            let wrap = wrap.or_else(|| meta.wrap_for(field));
            let col = quote_ident(field);

            // Value wraps (e.g. lower-casing) are applied client-side so
            // the SQL shape stays fixed per operator.
            let value = match wrap {
                Some(w) => w.apply(value.clone()),
                None => value.clone(),
            };

            let mut ph = |value: JsonValue, cast_sql: Option<&str>| {
                params.push(PgParam(value));
                let n = offset + params.len();
                match cast_sql {
                    Some(c) => format!("${n}::{c}"),
                    None => format!("${n}"),
                }
            };
            let scalar_cast = cast.map(Cast::sql);

            Ok(match op {
                Op::Eq => format!("{col} = {}", ph(value, scalar_cast)),
                Op::Gt => format!("{col} > {}", ph(value, scalar_cast)),
                Op::Gte => format!("{col} >= {}", ph(value, scalar_cast)),
                Op::Lt => format!("{col} < {}", ph(value, scalar_cast)),
                Op::Lte => format!("{col} <= {}", ph(value, scalar_cast)),
                Op::In => {
                    let items = value.as_array().ok_or_else(|| {
                        RepoError::config(format!("'in' predicate on '{field}' requires a list"))
                    })?;
                    if items.is_empty() {
                        // Unsatisfiable, never match-all and never a syntax error.
                        "FALSE".to_string()
                    } else {
                        let array_cast = cast.map(|c| format!("{}[]", c.sql()));
                        format!("{col} = ANY({})", ph(value.clone(), array_cast.as_deref()))
                    }
                }
                Op::Null => format!("{col} IS NULL"),
                Op::NotNull => format!("{col} IS NOT NULL"),
                Op::Contains => format!("{col} @> {}", ph(value, Some("jsonb"))),
                Op::ContainedBy => format!("{col} <@ {}", ph(value, Some("jsonb"))),
                Op::HasKey => format!("{col} ? {}", ph(value, None)),
                Op::HasKeys => format!("{col} ?& {}", ph(value, Some("text[]"))),
                Op::TsGte => {
                    let bound = ulid_bound(&value, field, TsBound::Lower)?;
                    format!("{col} >= {}", ph(JsonValue::String(bound), None))
                }
                Op::TsLte => {
                    let bound = ulid_bound(&value, field, TsBound::Upper)?;
                    format!("{col} <= {}", ph(JsonValue::String(bound), None))
                }
            })
        }
    }
}

enum TsBound {
    Lower,
    Upper,
}

/// Converts a timestamp bound into the smallest/largest ULID for that
/// millisecond, so the comparison is plain lexicographic on the key
/// column - no extraction function in SQL.
fn ulid_bound(value: &JsonValue, field: &str, bound: TsBound) -> Result<String, RepoError> {
    let ms = match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| {
                RepoError::config(format!("timestamp bound on '{field}' is not RFC 3339: {e}"))
            })?
            .timestamp_millis(),
        JsonValue::Number(n) => n.as_i64().ok_or_else(|| {
            RepoError::config(format!("timestamp bound on '{field}' is not integral"))
        })?,
        other => {
            return Err(RepoError::config(format!(
                "timestamp bound on '{field}' must be RFC 3339 or epoch millis, got {other}"
            )))
        }
    };
    if ms < 0 {
        return Err(RepoError::config(format!(
            "timestamp bound on '{field}' predates the epoch"
        )));
    }
    let random = match bound {
        TsBound::Lower => 0,
        TsBound::Upper => u128::MAX,
    };
    Ok(Ulid::from_parts(ms as u64, random).to_string())
}

/// Quotes an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renumbers `$1..$k` placeholders in a raw fragment by `by`.
fn shift_placeholders(sql: &str, by: usize) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            let mut num = String::new();
            while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                num.push(*d);
                chars.next();
            }
            let k: usize = num.parse().unwrap_or(0);
            out.push_str(&format!("${}", k + by));
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldMeta, PkStrategy};
    use serde_json::json;

    static META: TableMeta = TableMeta {
        table: "widgets",
        fields: &[
            FieldMeta::new("id").pk(PkStrategy::Ulid),
            FieldMeta::new("name"),
            FieldMeta::new("email").wrap(Wrap::Lower),
            FieldMeta::new("owner_id").cast(Cast::Uuid),
            FieldMeta::new("tags").cast(Cast::Jsonb),
        ],
    };

    #[test]
    fn test_empty_sequence_is_tautology() {
        let frag = compile(&[], &META, 0).unwrap();
        assert_eq!(frag.sql, "TRUE");
        assert!(frag.params.is_empty());
    }

    #[test]
    fn test_eq_shorthand() {
        let frag = compile(&[Predicate::eq("name", "bob")], &META, 0).unwrap();
        assert_eq!(frag.sql, "\"name\" = $1");
        assert_eq!(frag.params, vec![PgParam(json!("bob"))]);
    }

    #[test]
    fn test_sequence_is_implicit_and() {
        let frag = compile(
            &[Predicate::eq("name", "bob"), Predicate::not_null("tags")],
            &META,
            0,
        )
        .unwrap();
        assert_eq!(frag.sql, "\"name\" = $1 AND \"tags\" IS NOT NULL");
    }

    #[test]
    fn test_placeholder_offset() {
        let frag = compile(&[Predicate::eq("name", "bob")], &META, 2).unwrap();
        assert_eq!(frag.sql, "\"name\" = $3");
    }

    #[test]
    fn test_empty_in_is_unsatisfiable() {
        let frag = compile(&[Predicate::is_in::<String>("name", &[])], &META, 0).unwrap();
        assert_eq!(frag.sql, "FALSE");
        assert!(frag.params.is_empty());
    }

    #[test]
    fn test_in_lowers_to_any() {
        let frag = compile(&[Predicate::is_in("name", &["a", "b"])], &META, 0).unwrap();
        assert_eq!(frag.sql, "\"name\" = ANY($1)");
        assert_eq!(frag.params, vec![PgParam(json!(["a", "b"]))]);
    }

    #[test]
    fn test_in_with_metadata_cast() {
        let frag = compile(&[Predicate::is_in("owner_id", &["u1"])], &META, 0).unwrap();
        assert_eq!(frag.sql, "\"owner_id\" = ANY($1::uuid[])");
    }

    #[test]
    fn test_metadata_cast_applies() {
        let frag = compile(&[Predicate::eq("owner_id", "u1")], &META, 0).unwrap();
        assert_eq!(frag.sql, "\"owner_id\" = $1::uuid");
    }

    #[test]
    fn test_explicit_cast_overrides_metadata() {
        let frag = compile(
            &[Predicate::eq("owner_id", "u1").cast(Cast::Text)],
            &META,
            0,
        )
        .unwrap();
        assert_eq!(frag.sql, "\"owner_id\" = $1::text");
    }

    #[test]
    fn test_metadata_wrap_applies_to_value() {
        let frag = compile(&[Predicate::eq("email", "Bob@Example.COM")], &META, 0).unwrap();
        assert_eq!(frag.sql, "\"email\" = $1");
        assert_eq!(frag.params, vec![PgParam(json!("bob@example.com"))]);
    }

    #[test]
    fn test_json_containment() {
        let frag = compile(
            &[Predicate::cmp("tags", Op::Contains, json!({"env": "prod"}))],
            &META,
            0,
        )
        .unwrap();
        assert_eq!(frag.sql, "\"tags\" @> $1::jsonb");
    }

    #[test]
    fn test_has_keys() {
        let frag = compile(
            &[Predicate::cmp("tags", Op::HasKeys, json!(["env", "tier"]))],
            &META,
            0,
        )
        .unwrap();
        assert_eq!(frag.sql, "\"tags\" ?& $1::text[]");
    }

    #[test]
    fn test_ts_bounds_lower_to_ulid_comparisons() {
        let ts = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let frag = compile(&[Predicate::ts_gte("id", ts)], &META, 0).unwrap();
        assert_eq!(frag.sql, "\"id\" >= $1");

        let expected = Ulid::from_parts(ts.timestamp_millis() as u64, 0).to_string();
        assert_eq!(frag.params, vec![PgParam(json!(expected))]);

        let frag = compile(&[Predicate::ts_lte("id", ts)], &META, 0).unwrap();
        assert_eq!(frag.sql, "\"id\" <= $1");
        let expected = Ulid::from_parts(ts.timestamp_millis() as u64, u128::MAX).to_string();
        assert_eq!(frag.params, vec![PgParam(json!(expected))]);
    }

    #[test]
    fn test_raw_renumbers_placeholders() {
        let frag = compile(
            &[
                Predicate::eq("name", "bob"),
                Predicate::raw("char_length(\"name\") > $1", vec![json!(3)]),
            ],
            &META,
            0,
        )
        .unwrap();
        assert_eq!(frag.sql, "\"name\" = $1 AND (char_length(\"name\") > $2)");
        assert_eq!(frag.params.len(), 2);
    }

    #[test]
    fn test_unknown_column_rejected() {
        let result = compile(&[Predicate::eq("nope", 1)], &META, 0);
        assert!(matches!(result, Err(RepoError::Config(_))));
    }
}
