//! Column mutation intents and the SET-clause builder.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::db::PgParam;
use crate::error::RepoError;
use crate::repo::predicate::{quote_ident, Fragment};
use crate::schema::TableMeta;

/// Per-column mutation intent.
///
/// Every column value maps to exactly one variant - there are no sentinel
/// values to inspect at runtime.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    /// Plain value replacement.
    Value(JsonValue),
    /// Set to the database's current time.
    Now,
    /// Integer increment by delta (negative for decrement).
    Incr(i64),
    /// JSON document patch: set the value at a path, creating it if
    /// missing.
    JsonSet { path: Vec<String>, value: JsonValue },
    /// JSON document patch: delete the value at a path.
    JsonDelete { path: Vec<String> },
}

impl UpdateOp {
    /// Plain replacement from any serializable value.
    pub fn value(v: impl Serialize) -> Self {
        Self::Value(serde_json::to_value(v).expect("failed to serialize update value"))
    }
}

/// Ordered column -> mutation mapping for one update statement.
pub type Changes = BTreeMap<String, UpdateOp>;

/// Convenience constructor for a single-column change set.
pub fn change(column: impl Into<String>, op: UpdateOp) -> Changes {
    let mut changes = Changes::new();
    changes.insert(column.into(), op);
    changes
}

/// Builds the `SET ...` clause for an UPDATE (without the `SET` keyword).
///
/// The auto-touch column, when configured and not explicitly present in
/// `changes`, is appended as `now()`.
pub(crate) fn set_clause(
    changes: &Changes,
    meta: &TableMeta,
    offset: usize,
) -> Result<Fragment, RepoError> {
    if changes.is_empty() {
        return Err(RepoError::config("update with no columns to change"));
    }

    let mut parts = Vec::with_capacity(changes.len() + 1);
    let mut params: Vec<PgParam> = Vec::new();

    for (column, op) in changes {
        if !meta.has_column(column) {
            return Err(RepoError::config(format!(
                "unknown column '{column}' on table '{}'",
                meta.table
            )));
        }
        let col = quote_ident(column);
        let mut ph = |value: JsonValue, cast: Option<&str>| {
            params.push(PgParam(value));
            let n = offset + params.len();
            match cast {
                Some(c) => format!("${n}::{c}"),
                None => format!("${n}"),
            }
        };

        parts.push(match op {
            UpdateOp::Value(v) => {
                let cast = meta.cast_for(column).map(crate::schema::Cast::sql);
                format!("{col} = {}", ph(v.clone(), cast))
            }
            UpdateOp::Now => format!("{col} = now()"),
            UpdateOp::Incr(delta) => {
                format!("{col} = {col} + {}", ph(JsonValue::from(*delta), None))
            }
            UpdateOp::JsonSet { path, value } => {
                let path_ph = ph(JsonValue::from(path.clone()), Some("text[]"));
                let value_ph = ph(value.clone(), Some("jsonb"));
                format!("{col} = jsonb_set({col}, {path_ph}, {value_ph}, true)")
            }
            UpdateOp::JsonDelete { path } => {
                let path_ph = ph(JsonValue::from(path.clone()), Some("text[]"));
                format!("{col} = {col} #- {path_ph}")
            }
        });
    }

    if let Some(touch) = meta.touch_col() {
        if !changes.contains_key(touch) {
            parts.push(format!("{} = now()", quote_ident(touch)));
        }
    }

    Ok(Fragment {
        sql: parts.join(", "),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Cast, FieldMeta, PkStrategy};
    use serde_json::json;

    static META: TableMeta = TableMeta {
        table: "widgets",
        fields: &[
            FieldMeta::new("id").pk(PkStrategy::Ulid),
            FieldMeta::new("name"),
            FieldMeta::new("count"),
            FieldMeta::new("profile").cast(Cast::Jsonb),
            FieldMeta::new("updated_at").cast(Cast::Timestamptz).touch(),
        ],
    };

    static META_NO_TOUCH: TableMeta = TableMeta {
        table: "plain",
        fields: &[FieldMeta::new("id").pk(PkStrategy::Ulid), FieldMeta::new("name")],
    };

    #[test]
    fn test_value_replacement_appends_touch() {
        let frag = set_clause(&change("name", UpdateOp::value("x")), &META, 0).unwrap();
        assert_eq!(frag.sql, "\"name\" = $1, \"updated_at\" = now()");
        assert_eq!(frag.params, vec![PgParam(json!("x"))]);
    }

    #[test]
    fn test_no_touch_column_configured() {
        let frag = set_clause(&change("name", UpdateOp::value("x")), &META_NO_TOUCH, 0).unwrap();
        assert_eq!(frag.sql, "\"name\" = $1");
    }

    #[test]
    fn test_explicit_touch_not_duplicated() {
        let mut changes = Changes::new();
        changes.insert("updated_at".into(), UpdateOp::Now);
        let frag = set_clause(&changes, &META, 0).unwrap();
        assert_eq!(frag.sql, "\"updated_at\" = now()");
    }

    #[test]
    fn test_incr() {
        let frag = set_clause(&change("count", UpdateOp::Incr(-2)), &META, 0).unwrap();
        assert_eq!(
            frag.sql,
            "\"count\" = \"count\" + $1, \"updated_at\" = now()"
        );
        assert_eq!(frag.params, vec![PgParam(json!(-2))]);
    }

    #[test]
    fn test_json_set_at_path() {
        let frag = set_clause(
            &change(
                "profile",
                UpdateOp::JsonSet {
                    path: vec!["a".into(), "b".into()],
                    value: json!(5),
                },
            ),
            &META,
            0,
        )
        .unwrap();
        assert_eq!(
            frag.sql,
            "\"profile\" = jsonb_set(\"profile\", $1::text[], $2::jsonb, true), \"updated_at\" = now()"
        );
        assert_eq!(frag.params.len(), 2);
    }

    #[test]
    fn test_json_delete_at_path() {
        let frag = set_clause(
            &change("profile", UpdateOp::JsonDelete { path: vec!["a".into()] }),
            &META,
            0,
        )
        .unwrap();
        assert_eq!(
            frag.sql,
            "\"profile\" = \"profile\" #- $1::text[], \"updated_at\" = now()"
        );
    }

    #[test]
    fn test_placeholder_offset() {
        let frag = set_clause(&change("name", UpdateOp::value("x")), &META, 4).unwrap();
        assert_eq!(frag.sql, "\"name\" = $5, \"updated_at\" = now()");
    }

    #[test]
    fn test_empty_changes_rejected() {
        let result = set_clause(&Changes::new(), &META, 0);
        assert!(matches!(result, Err(RepoError::Config(_))));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let result = set_clause(&change("nope", UpdateOp::value(1)), &META, 0);
        assert!(matches!(result, Err(RepoError::Config(_))));
    }

    #[test]
    fn test_value_with_metadata_cast() {
        let frag = set_clause(&change("profile", UpdateOp::value(json!({"a": 1}))), &META, 0)
            .unwrap();
        assert_eq!(
            frag.sql,
            "\"profile\" = $1::jsonb, \"updated_at\" = now()"
        );
    }
}
