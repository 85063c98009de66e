//! Write-path operations: insert, conditional update, upsert with
//! optimistic concurrency, MERGE with action tracking, soft-delete
//! toggling, and retention purge.
//!
//! Every operation here is a single SQL statement, atomic by
//! construction; multi-statement atomicity is the caller's transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use ulid::Ulid;

use crate::db::{PgParam, SqlRunner};
use crate::error::RepoError;
use crate::repo::predicate::{compile, quote_ident, Predicate};
use crate::repo::update::{set_clause, Changes};
use crate::repo::{scoped_where, Repo, Scope};
use crate::schema::{Entity, PkStrategy, TableMeta};

/// Optimistic-concurrency intent for a single-item upsert.
///
/// The intent is explicit rather than inferred from an optional argument,
/// so "OCC requested" and "row truly absent" can never be conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occ {
    /// No concurrency check; the conflict branch always applies.
    None,
    /// The conflict branch applies only when the stored auto-touch
    /// timestamp equals this value; a mismatch surfaces
    /// [`RepoError::Stale`].
    Expect(DateTime<Utc>),
}

/// Target of a single-row mutation.
#[derive(Debug, Clone)]
pub enum Target {
    /// Primary-key value.
    Key(JsonValue),
    /// Arbitrary predicate; the first matching active row (by primary
    /// key) is targeted.
    Where(Vec<Predicate>),
}

impl Target {
    pub fn key(value: impl Serialize) -> Self {
        Self::Key(serde_json::to_value(value).expect("failed to serialize key"))
    }
}

/// Which MERGE branch fired for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
}

/// A merged row tagged with the branch that produced it.
#[derive(Debug, Clone)]
pub struct Merged<E> {
    pub outcome: MergeOutcome,
    pub row: E,
}

/// One insert payload: ordered columns shared by the batch plus
/// per-entity parameter rows.
struct InsertPlan {
    columns: Vec<&'static str>,
    rows: Vec<Vec<PgParam>>,
}

impl InsertPlan {
    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `($1, $2), ($3, $4)` with optional per-column casts.
    fn values_list(&self, meta: &TableMeta, with_casts: bool) -> String {
        let width = self.columns.len();
        (0..self.rows.len())
            .map(|r| {
                let row = (0..width)
                    .map(|c| {
                        let n = r * width + c + 1;
                        match meta.cast_for(self.columns[c]).filter(|_| with_casts) {
                            Some(cast) => format!("${n}::{}", cast.sql()),
                            None => format!("${n}"),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({row})")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn params(&self) -> Vec<PgParam> {
        self.rows.iter().flatten().cloned().collect()
    }
}

impl<E: Entity, X: SqlRunner> Repo<E, X> {
    /// Serializes and validates one insert payload against the table's
    /// insert projection; generates the primary key when the strategy
    /// calls for it.
    fn insert_payload(entity: &E) -> Result<JsonMap<String, JsonValue>, RepoError> {
        let meta = Self::meta();
        let value = serde_json::to_value(entity)
            .map_err(|e| RepoError::config(format!("unserializable write payload: {e}")))?;
        let JsonValue::Object(mut map) = value else {
            return Err(RepoError::config(
                "write payload must serialize to an object",
            ));
        };

        for field in meta.fields {
            let present = map.get(field.name).is_some_and(|v| !v.is_null());
            match field.pk {
                Some(PkStrategy::Ulid) if !present => {
                    map.insert(
                        field.name.to_string(),
                        JsonValue::String(Ulid::new().to_string()),
                    );
                }
                Some(PkStrategy::Provided) if !present => {
                    return Err(RepoError::config(format!(
                        "write payload missing primary key '{}'",
                        field.name
                    )));
                }
                _ => {
                    if !map.contains_key(field.name) && field.pk.is_none() {
                        return Err(RepoError::config(format!(
                            "write payload missing column '{}'",
                            field.name
                        )));
                    }
                }
            }
        }

        // The touch column is stamped on insert too, so freshly inserted
        // rows carry a timestamp for later concurrency checks.
        if let Some(touch) = meta.touch_col() {
            if !map.get(touch).is_some_and(|v| !v.is_null()) {
                map.insert(
                    touch.to_string(),
                    JsonValue::String(Utc::now().to_rfc3339()),
                );
            }
        }
        Ok(map)
    }

    /// Builds the shared column list and parameter rows for a batch.
    fn insert_plan(items: &[E]) -> Result<InsertPlan, RepoError> {
        let meta = Self::meta();
        let payloads = items
            .iter()
            .map(Self::insert_payload)
            .collect::<Result<Vec<_>, _>>()?;

        // DbDefault keys are omitted only when absent in every payload,
        // so the batch shares one column list.
        let columns: Vec<&'static str> = meta
            .fields
            .iter()
            .filter(|f| {
                !(f.pk == Some(PkStrategy::DbDefault)
                    && payloads
                        .iter()
                        .all(|p| !p.get(f.name).is_some_and(|v| !v.is_null())))
            })
            .map(|f| f.name)
            .collect();

        let rows = payloads
            .into_iter()
            .map(|mut p| {
                columns
                    .iter()
                    .map(|c| PgParam(p.remove(*c).unwrap_or(JsonValue::Null)))
                    .collect()
            })
            .collect();

        Ok(InsertPlan { columns, rows })
    }

    /// Inserts a single row and returns it as stored.
    pub async fn put_one(&self, entity: &E) -> Result<E, RepoError> {
        let mut rows = self.insert_rows(std::slice::from_ref(entity), None).await?;
        rows.pop()
            .ok_or_else(|| RepoError::decode(Self::meta().table, "insert returned no row"))
    }

    /// Inserts a batch in one statement. An empty batch succeeds with an
    /// empty result.
    pub async fn put_many(&self, items: &[E]) -> Result<Vec<E>, RepoError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        self.insert_rows(items, None).await
    }

    /// Insert that degenerates to an upsert on the supplied inline
    /// conflict keys.
    pub async fn put_one_on_conflict(&self, entity: &E, keys: &[&str]) -> Result<E, RepoError> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let mut rows = self
            .insert_rows(
                std::slice::from_ref(entity),
                Some(ConflictClause {
                    keys: &keys,
                    update_columns: None,
                    occ: Occ::None,
                }),
            )
            .await?;
        rows.pop()
            .ok_or_else(|| RepoError::config("upsert conflict branch returned no row"))
    }

    async fn insert_rows(
        &self,
        items: &[E],
        conflict: Option<ConflictClause<'_>>,
    ) -> Result<Vec<E>, RepoError> {
        let meta = Self::meta();
        let plan = Self::insert_plan(items)?;
        let mut params = plan.params();

        let conflict_sql = match conflict {
            Some(clause) => clause.sql(meta, &plan.columns, &mut params)?,
            None => String::new(),
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}{conflict_sql} RETURNING *",
            quote_ident(meta.table),
            plan.column_list(),
            plan.values_list(meta, false),
        );

        let rows = self.exec().query(&sql, &params).await?;
        rows.into_iter().map(E::decode).collect()
    }

    /// Single-item upsert on the configured conflict keys.
    ///
    /// With [`Occ::Expect`], the conflict branch carries a
    /// `WHERE <table>.<touch> = <expected>` guard: the statement
    /// returning no row then means the row exists with a different
    /// timestamp, surfaced as [`RepoError::Stale`].
    pub async fn upsert_one(&self, entity: &E, occ: Occ) -> Result<E, RepoError> {
        let conflict = self.opts().conflict_or_err()?.clone();
        let mut rows = self
            .insert_rows(
                std::slice::from_ref(entity),
                Some(ConflictClause {
                    keys: &conflict.keys,
                    update_columns: conflict.update_columns.as_deref(),
                    occ,
                }),
            )
            .await?;
        match (rows.pop(), occ) {
            (Some(row), _) => Ok(row),
            (None, Occ::Expect(expected)) => Err(RepoError::Stale { expected }),
            (None, Occ::None) => Err(RepoError::config("upsert conflict branch returned no row")),
        }
    }

    /// Batch upsert in one multi-row statement, without per-row
    /// concurrency checks. An empty batch succeeds with an empty result.
    pub async fn upsert_many(&self, items: &[E]) -> Result<Vec<E>, RepoError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let conflict = self.opts().conflict_or_err()?.clone();
        self.insert_rows(
            items,
            Some(ConflictClause {
                keys: &conflict.keys,
                update_columns: conflict.update_columns.as_deref(),
                occ: Occ::None,
            }),
        )
        .await
    }

    /// One MERGE from a values-list source: updates non-key columns on
    /// match, inserts on no-match, and tags every returned row with the
    /// branch that fired.
    pub async fn merge(&self, items: &[E]) -> Result<Vec<Merged<E>>, RepoError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let meta = Self::meta();
        let conflict = self.opts().conflict_or_err()?.clone();
        validate_keys(meta, &conflict.keys)?;

        let plan = Self::insert_plan(items)?;
        let params = plan.params();

        let src_columns = plan.column_list();
        let on = conflict
            .keys
            .iter()
            .map(|k| format!("t.{k} = src.{k}", k = quote_ident(k)))
            .collect::<Vec<_>>()
            .join(" AND ");

        let update_cols =
            update_columns(meta, &plan.columns, &conflict.keys, conflict.update_columns.as_deref())?;
        let mut set_parts: Vec<String> = update_cols
            .iter()
            .map(|c| format!("{c} = src.{c}", c = quote_ident(c)))
            .collect();
        if let Some(touch) = meta.touch_col() {
            set_parts.push(format!("{} = now()", quote_ident(touch)));
        }

        let insert_values = plan
            .columns
            .iter()
            .map(|c| format!("src.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "MERGE INTO {} AS t USING (VALUES {}) AS src ({src_columns}) ON {on} \
             WHEN MATCHED THEN UPDATE SET {} \
             WHEN NOT MATCHED THEN INSERT ({src_columns}) VALUES ({insert_values}) \
             RETURNING merge_action() AS action, t.*",
            quote_ident(meta.table),
            plan.values_list(meta, true),
            set_parts.join(", "),
        );

        let rows = self.exec().query(&sql, &params).await?;
        rows.into_iter()
            .map(|mut row| {
                let action: String = row
                    .take("action")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| RepoError::decode("action", "merge returned no action"))?;
                let outcome = match action.as_str() {
                    "INSERT" => MergeOutcome::Inserted,
                    "UPDATE" => MergeOutcome::Updated,
                    other => {
                        return Err(RepoError::decode(
                            "action",
                            format!("unexpected merge action '{other}'"),
                        ))
                    }
                };
                Ok(Merged {
                    outcome,
                    row: E::decode(row)?,
                })
            })
            .collect()
    }

    /// Updates a single targeted row. `None` is the typed absence when
    /// the target (or guard) matches nothing.
    pub async fn set_one(&self, target: Target, changes: Changes) -> Result<Option<E>, RepoError> {
        self.update_one(target, changes, &[]).await
    }

    /// [`set_one`](Repo::set_one) with a mandatory guard predicate ANDed
    /// into the WHERE clause - conditional updates without OCC
    /// timestamps.
    pub async fn set_if(
        &self,
        target: Target,
        changes: Changes,
        guard: &[Predicate],
    ) -> Result<Option<E>, RepoError> {
        if guard.is_empty() {
            return Err(RepoError::config("set_if requires a guard predicate"));
        }
        self.update_one(target, changes, guard).await
    }

    async fn update_one(
        &self,
        target: Target,
        changes: Changes,
        guard: &[Predicate],
    ) -> Result<Option<E>, RepoError> {
        let meta = Self::meta();
        let pk = quote_ident(meta.pk_or_err()?.name);
        let set = set_clause(&changes, meta, 0)?;
        let mut params = set.params;

        let target_sql = match target {
            Target::Key(value) => {
                params.push(PgParam(value));
                format!("{pk} = ${}", params.len())
            }
            Target::Where(preds) => {
                let frag = compile(&preds, meta, params.len())?;
                params.extend(frag.params);
                // Subselect pins the statement to at most one row.
                format!(
                    "{pk} = (SELECT {pk} FROM {} WHERE {} ORDER BY {pk} LIMIT 1)",
                    quote_ident(meta.table),
                    scoped_where(&frag.sql, meta, Scope::Active),
                )
            }
        };

        let guard_frag = compile(guard, meta, params.len())?;
        params.extend(guard_frag.params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {} RETURNING *",
            quote_ident(meta.table),
            set.sql,
            scoped_where(
                &format!("{target_sql} AND {}", guard_frag.sql),
                meta,
                Scope::Active
            ),
        );

        let row = self.exec().query_opt(&sql, &params).await?;
        row.map(E::decode).transpose()
    }

    /// Bulk update; returns the affected-row count.
    pub async fn set_many(&self, preds: &[Predicate], changes: Changes) -> Result<u64, RepoError> {
        let meta = Self::meta();
        let set = set_clause(&changes, meta, 0)?;
        let frag = compile(preds, meta, set.params.len())?;
        let mut params = set.params;
        params.extend(frag.params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(meta.table),
            set.sql,
            scoped_where(&frag.sql, meta, Scope::Active),
        );
        self.exec().execute(&sql, &params).await
    }

    /// Soft-deletes a single row and returns it.
    pub async fn drop_one(&self, key: impl Serialize) -> Result<E, RepoError> {
        self.toggle_one(key, true).await
    }

    /// Restores a single soft-deleted row and returns it.
    pub async fn lift_one(&self, key: impl Serialize) -> Result<E, RepoError> {
        self.toggle_one(key, false).await
    }

    async fn toggle_one(&self, key: impl Serialize, delete: bool) -> Result<E, RepoError> {
        let (sql, mut params) = Self::toggle_sql(delete, "= $1")?;
        params.push(PgParam(
            serde_json::to_value(key).expect("failed to serialize key"),
        ));
        let row = self.exec().query_opt(&sql, &params).await?;
        row.map(E::decode).transpose()?.ok_or(RepoError::NotFound)
    }

    /// Soft-deletes a set of rows by key; returns the affected count.
    pub async fn drop_many<T: Serialize>(&self, keys: &[T]) -> Result<u64, RepoError> {
        self.toggle_many(keys, true).await
    }

    /// Restores a set of soft-deleted rows by key.
    pub async fn lift_many<T: Serialize>(&self, keys: &[T]) -> Result<u64, RepoError> {
        self.toggle_many(keys, false).await
    }

    async fn toggle_many<T: Serialize>(&self, keys: &[T], delete: bool) -> Result<u64, RepoError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let (sql, mut params) = Self::toggle_sql(delete, "= ANY($1)")?;
        params.push(PgParam(
            serde_json::to_value(keys).expect("failed to serialize keys"),
        ));
        self.exec().execute(&sql, &params).await
    }

    /// Soft-deletes every active row matching the predicate sequence.
    pub async fn drop_where(&self, preds: &[Predicate]) -> Result<u64, RepoError> {
        self.toggle_where(preds, true).await
    }

    /// Restores every soft-deleted row matching the predicate sequence.
    pub async fn lift_where(&self, preds: &[Predicate]) -> Result<u64, RepoError> {
        self.toggle_where(preds, false).await
    }

    async fn toggle_where(&self, preds: &[Predicate], delete: bool) -> Result<u64, RepoError> {
        let meta = Self::meta();
        let soft = meta.soft_delete_col().ok_or_else(|| {
            RepoError::config(format!("table '{}' has no soft-delete column", meta.table))
        })?;
        let frag = compile(preds, meta, 0)?;
        let state = if delete { "IS NULL" } else { "IS NOT NULL" };
        let sql = format!(
            "UPDATE {} SET {} WHERE ({}) AND {} {state}",
            quote_ident(meta.table),
            Self::toggle_set(delete, soft),
            frag.sql,
            quote_ident(soft),
        );
        self.exec().execute(&sql, &frag.params).await
    }

    fn toggle_sql(delete: bool, key_match: &str) -> Result<(String, Vec<PgParam>), RepoError> {
        let meta = Self::meta();
        let soft = meta.soft_delete_col().ok_or_else(|| {
            RepoError::config(format!("table '{}' has no soft-delete column", meta.table))
        })?;
        let pk = quote_ident(meta.pk_or_err()?.name);
        let state = if delete { "IS NULL" } else { "IS NOT NULL" };
        let sql = format!(
            "UPDATE {} SET {} WHERE {pk} {key_match} AND {} {state} RETURNING *",
            quote_ident(meta.table),
            Self::toggle_set(delete, soft),
            quote_ident(soft),
        );
        Ok((sql, Vec::new()))
    }

    fn toggle_set(delete: bool, soft: &str) -> String {
        let meta = Self::meta();
        let value = if delete { "now()" } else { "NULL" };
        let mut parts = vec![format!("{} = {value}", quote_ident(soft))];
        if let Some(touch) = meta.touch_col().filter(|t| *t != soft) {
            parts.push(format!("{} = now()", quote_ident(touch)));
        }
        parts.join(", ")
    }

    /// Invokes the configured retention stored function with a day-count
    /// argument and returns the number of rows it purged.
    pub async fn purge(&self, days: u32) -> Result<i64, RepoError> {
        let name = self.opts().purge_fn_or_err()?.to_string();
        let sql = format!("SELECT {}($1::int4) AS purged", quote_ident(&name));
        let row = self
            .exec()
            .query_opt(&sql, &[PgParam(JsonValue::from(days))])
            .await?
            .ok_or_else(|| RepoError::decode("purged", "purge function returned no row"))?;
        row.get("purged")
    }
}

/// Renders `ON CONFLICT ... DO UPDATE SET ...` with an optional
/// optimistic-concurrency guard.
struct ConflictClause<'a> {
    keys: &'a [String],
    update_columns: Option<&'a [String]>,
    occ: Occ,
}

impl ConflictClause<'_> {
    fn sql(
        &self,
        meta: &TableMeta,
        insert_columns: &[&'static str],
        params: &mut Vec<PgParam>,
    ) -> Result<String, RepoError> {
        validate_keys(meta, self.keys)?;

        let key_list = self
            .keys
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");

        let update_cols = update_columns(meta, insert_columns, self.keys, self.update_columns)?;
        let mut set_parts: Vec<String> = update_cols
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}", c = quote_ident(c)))
            .collect();
        if let Some(touch) = meta.touch_col() {
            set_parts.push(format!("{} = now()", quote_ident(touch)));
        }

        let occ_sql = match self.occ {
            Occ::None => String::new(),
            Occ::Expect(expected) => {
                let touch = meta.touch_col().ok_or_else(|| {
                    RepoError::config(format!(
                        "table '{}' has no auto-touch column for concurrency checks",
                        meta.table
                    ))
                })?;
                params.push(PgParam(JsonValue::String(expected.to_rfc3339())));
                format!(
                    " WHERE {}.{} = ${}::timestamptz",
                    quote_ident(meta.table),
                    quote_ident(touch),
                    params.len()
                )
            }
        };

        Ok(format!(
            " ON CONFLICT ({key_list}) DO UPDATE SET {}{occ_sql}",
            set_parts.join(", "),
        ))
    }
}

fn validate_keys(meta: &TableMeta, keys: &[String]) -> Result<(), RepoError> {
    if keys.is_empty() {
        return Err(RepoError::config("conflict key list is empty"));
    }
    for key in keys {
        if !meta.has_column(key) {
            return Err(RepoError::config(format!(
                "unknown conflict key '{key}' on table '{}'",
                meta.table
            )));
        }
    }
    Ok(())
}

/// Columns the conflict/match branch updates: the configured subset, or
/// every inserted column that is neither a key, the primary key, nor the
/// auto-touch column.
fn update_columns<'a>(
    meta: &TableMeta,
    insert_columns: &[&'static str],
    keys: &[String],
    subset: Option<&'a [String]>,
) -> Result<Vec<String>, RepoError> {
    match subset {
        Some(columns) => {
            for col in columns {
                if !meta.has_column(col) {
                    return Err(RepoError::config(format!(
                        "unknown update column '{col}' on table '{}'",
                        meta.table
                    )));
                }
            }
            Ok(columns.to_vec())
        }
        None => {
            let pk = meta.pk().map(|f| f.name);
            let touch = meta.touch_col();
            let columns: Vec<String> = insert_columns
                .iter()
                .filter(|c| {
                    !keys.iter().any(|k| k == **c)
                        && Some(**c) != pk
                        && Some(**c) != touch
                })
                .map(|c| c.to_string())
                .collect();
            if columns.is_empty() {
                return Err(RepoError::config(
                    "conflict update has no columns to change",
                ));
            }
            Ok(columns)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Row;
    use crate::repo::testutil::{widget, widget_row, MockRunner, Widget};
    use crate::repo::update::{change, UpdateOp};
    use crate::repo::RepoOptions;
    use crate::schema::FieldMeta;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    fn repo_with(opts: RepoOptions) -> (Arc<MockRunner>, Repo<Widget, Arc<MockRunner>>) {
        let runner = Arc::new(MockRunner::new());
        let repo = Repo::new(runner.clone(), opts);
        (runner, repo)
    }

    fn repo() -> (Arc<MockRunner>, Repo<Widget, Arc<MockRunner>>) {
        repo_with(RepoOptions::new())
    }

    fn merged_row(w: &Widget, action: &str) -> Row {
        let JsonValue::Object(mut map) = serde_json::to_value(w).unwrap() else {
            unreachable!();
        };
        map.insert("action".to_string(), json!(action));
        Row::new(map.into_iter().collect())
    }

    #[tokio::test]
    async fn test_put_one_builds_full_projection() {
        let (runner, repo) = repo();
        runner.push_rows(vec![widget_row(&widget("w1", "a"))]);

        let stored = repo.put_one(&widget("w1", "a")).await.unwrap();
        assert_eq!(stored.id, "w1");

        let (sql, params) = &runner.recorded()[0];
        assert_eq!(
            sql,
            "INSERT INTO \"widgets\" (\"id\", \"name\", \"status\", \"count\", \"tags\", \
             \"updated_at\", \"deleted_at\", \"expires_at\") \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *"
        );
        assert_eq!(params.len(), 8);
    }

    #[tokio::test]
    async fn test_put_many_empty_is_ok_without_sql() {
        let (runner, repo) = repo();
        let stored = repo.put_many(&[]).await.unwrap();
        assert!(stored.is_empty());
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_put_many_is_one_multi_row_statement() {
        let (runner, repo) = repo();
        runner.push_rows(vec![
            widget_row(&widget("w1", "a")),
            widget_row(&widget("w2", "b")),
        ]);

        let stored = repo
            .put_many(&[widget("w1", "a"), widget("w2", "b")])
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);

        let recorded = runner.recorded();
        assert_eq!(recorded.len(), 1);
        let (sql, params) = &recorded[0];
        assert!(sql.contains("($1, $2, $3, $4, $5, $6, $7, $8), ($9, $10, $11, $12, $13, $14, $15, $16)"));
        assert_eq!(params.len(), 16);
    }

    #[tokio::test]
    async fn test_upsert_fails_closed_without_conflict_keys() {
        let (runner, repo) = repo();
        let result = repo.upsert_one(&widget("w1", "a"), Occ::None).await;
        assert!(matches!(result, Err(RepoError::Config(_))));
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_occ_adds_timestamp_guard() {
        let (runner, repo) = repo_with(RepoOptions::new().conflict_keys(["id"]));
        runner.push_rows(vec![widget_row(&widget("w1", "a"))]);

        let expected = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        repo.upsert_one(&widget("w1", "a"), Occ::Expect(expected))
            .await
            .unwrap();

        let (sql, params) = &runner.recorded()[0];
        assert!(sql.contains(
            "ON CONFLICT (\"id\") DO UPDATE SET \
             \"name\" = EXCLUDED.\"name\", \"status\" = EXCLUDED.\"status\", \
             \"count\" = EXCLUDED.\"count\", \"tags\" = EXCLUDED.\"tags\", \
             \"deleted_at\" = EXCLUDED.\"deleted_at\", \"expires_at\" = EXCLUDED.\"expires_at\", \
             \"updated_at\" = now() \
             WHERE \"widgets\".\"updated_at\" = $9::timestamptz"
        ));
        assert_eq!(params[8], PgParam(json!(expected.to_rfc3339())));
    }

    #[tokio::test]
    async fn test_upsert_occ_mismatch_is_stale() {
        let (_, repo) = repo_with(RepoOptions::new().conflict_keys(["id"]));
        // conflict branch filtered out by the timestamp guard -> no row
        let expected = Utc::now();
        let result = repo
            .upsert_one(&widget("w1", "a"), Occ::Expect(expected))
            .await;
        assert!(matches!(result, Err(RepoError::Stale { .. })));
    }

    #[tokio::test]
    async fn test_upsert_no_row_without_occ_is_config() {
        let (_, repo) = repo_with(RepoOptions::new().conflict_keys(["id"]));
        let result = repo.upsert_one(&widget("w1", "a"), Occ::None).await;
        assert!(matches!(result, Err(RepoError::Config(_))));
    }

    #[tokio::test]
    async fn test_upsert_respects_update_column_subset() {
        let (runner, repo) = repo_with(
            RepoOptions::new()
                .conflict_keys(["id"])
                .conflict_update_columns(["name"]),
        );
        runner.push_rows(vec![widget_row(&widget("w1", "a"))]);
        repo.upsert_one(&widget("w1", "a"), Occ::None).await.unwrap();

        let (sql, _) = &runner.recorded()[0];
        assert!(sql.contains(
            "DO UPDATE SET \"name\" = EXCLUDED.\"name\", \"updated_at\" = now()"
        ));
    }

    #[tokio::test]
    async fn test_merge_tags_each_branch() {
        let (runner, repo) = repo_with(RepoOptions::new().conflict_keys(["id"]));
        runner.push_rows(vec![
            merged_row(&widget("a", "x"), "UPDATE"),
            merged_row(&widget("b", "y"), "INSERT"),
        ]);

        let merged = repo
            .merge(&[widget("a", "x"), widget("b", "y")])
            .await
            .unwrap();
        assert_eq!(merged[0].outcome, MergeOutcome::Updated);
        assert_eq!(merged[0].row.id, "a");
        assert_eq!(merged[1].outcome, MergeOutcome::Inserted);
        assert_eq!(merged[1].row.id, "b");

        let (sql, _) = &runner.recorded()[0];
        assert!(sql.starts_with("MERGE INTO \"widgets\" AS t USING (VALUES"));
        assert!(sql.contains("ON t.\"id\" = src.\"id\""));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT"));
        assert!(sql.ends_with("RETURNING merge_action() AS action, t.*"));
        // values carry metadata casts so the source rows are typed
        assert!(sql.contains("$5::jsonb"));
        assert!(sql.contains("$6::timestamptz"));
    }

    #[tokio::test]
    async fn test_merge_empty_is_ok_without_sql() {
        let (runner, repo) = repo_with(RepoOptions::new().conflict_keys(["id"]));
        assert!(repo.merge(&[]).await.unwrap().is_empty());
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_set_one_by_key() {
        let (runner, repo) = repo();
        runner.push_rows(vec![widget_row(&widget("w1", "b"))]);

        let updated = repo
            .set_one(Target::key("w1"), change("name", UpdateOp::value("b")))
            .await
            .unwrap();
        assert_eq!(updated.unwrap().name, "b");

        let (sql, params) = &runner.recorded()[0];
        assert!(sql.starts_with(
            "UPDATE \"widgets\" SET \"name\" = $1, \"updated_at\" = now() WHERE (\"id\" = $2"
        ));
        assert!(sql.contains("\"deleted_at\" IS NULL"));
        assert!(sql.ends_with("RETURNING *"));
        assert_eq!(params.len(), 2);
    }

    #[tokio::test]
    async fn test_set_one_by_predicate_pins_single_row() {
        let (runner, repo) = repo();
        repo.set_one(
            Target::Where(vec![Predicate::eq("status", "active")]),
            change("name", UpdateOp::value("b")),
        )
        .await
        .unwrap();

        let (sql, _) = &runner.recorded()[0];
        assert!(sql.contains("\"id\" = (SELECT \"id\" FROM \"widgets\" WHERE"));
        assert!(sql.contains("LIMIT 1)"));
    }

    #[tokio::test]
    async fn test_set_if_guard_miss_is_typed_absence() {
        let (runner, repo) = repo();
        // guard filters the row out -> UPDATE matches nothing
        let result = repo
            .set_if(
                Target::key("w1"),
                change("name", UpdateOp::value("b")),
                &[Predicate::eq("count", 1)],
            )
            .await
            .unwrap();
        assert!(result.is_none());

        let (sql, _) = &runner.recorded()[0];
        assert!(sql.contains("\"count\" = $3"));
    }

    #[tokio::test]
    async fn test_set_if_requires_guard() {
        let (runner, repo) = repo();
        let result = repo
            .set_if(Target::key("w1"), change("name", UpdateOp::value("b")), &[])
            .await;
        assert!(matches!(result, Err(RepoError::Config(_))));
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_set_many_returns_affected_count() {
        let (runner, repo) = repo();
        runner.push_count(3);
        let count = repo
            .set_many(
                &[Predicate::eq("status", "active")],
                change("count", UpdateOp::Incr(1)),
            )
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_drop_one_toggles_and_returns_row() {
        let (runner, repo) = repo();
        let mut dropped = widget("w1", "a");
        dropped.deleted_at = Some(Utc::now());
        runner.push_rows(vec![widget_row(&dropped)]);

        let row = repo.drop_one("w1").await.unwrap();
        assert!(row.deleted_at.is_some());

        let (sql, params) = &runner.recorded()[0];
        assert_eq!(
            sql,
            "UPDATE \"widgets\" SET \"deleted_at\" = now(), \"updated_at\" = now() \
             WHERE \"id\" = $1 AND \"deleted_at\" IS NULL RETURNING *"
        );
        assert_eq!(params[0], PgParam(json!("w1")));
    }

    #[tokio::test]
    async fn test_lift_one_restores() {
        let (runner, repo) = repo();
        runner.push_rows(vec![widget_row(&widget("w1", "a"))]);

        repo.lift_one("w1").await.unwrap();

        let (sql, _) = &runner.recorded()[0];
        assert_eq!(
            sql,
            "UPDATE \"widgets\" SET \"deleted_at\" = NULL, \"updated_at\" = now() \
             WHERE \"id\" = $1 AND \"deleted_at\" IS NOT NULL RETURNING *"
        );
    }

    #[tokio::test]
    async fn test_drop_one_missing_row_is_not_found() {
        let (_, repo) = repo();
        assert!(matches!(
            repo.drop_one("nope").await,
            Err(RepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_drop_many_uses_any() {
        let (runner, repo) = repo();
        runner.push_count(2);
        let count = repo.drop_many(&["w1", "w2"]).await.unwrap();
        assert_eq!(count, 2);

        let (sql, _) = &runner.recorded()[0];
        assert!(sql.contains("\"id\" = ANY($1)"));
    }

    #[tokio::test]
    async fn test_drop_requires_soft_delete_column() {
        #[derive(Debug, Clone, serde::Serialize, Deserialize, PartialEq)]
        struct Plain {
            id: String,
            name: String,
        }
        static PLAIN_META: TableMeta = TableMeta {
            table: "plain",
            fields: &[
                FieldMeta::new("id").pk(PkStrategy::Provided),
                FieldMeta::new("name"),
            ],
        };
        impl Entity for Plain {
            fn meta() -> &'static TableMeta {
                &PLAIN_META
            }
        }

        let runner = Arc::new(MockRunner::new());
        let repo: Repo<Plain, Arc<MockRunner>> = Repo::new(runner.clone(), RepoOptions::new());
        assert!(matches!(
            repo.drop_one("p1").await,
            Err(RepoError::Config(_))
        ));
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_purge_unconfigured_is_config_error() {
        let (runner, repo) = repo();
        assert!(matches!(repo.purge(30).await, Err(RepoError::Config(_))));
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_purge_invokes_configured_function() {
        let (runner, repo) = repo_with(RepoOptions::new().purge_fn("fn_purge_widgets"));
        runner.push_rows(vec![Row::new(
            [("purged".to_string(), json!(5))].into_iter().collect(),
        )]);

        assert_eq!(repo.purge(30).await.unwrap(), 5);

        let (sql, params) = &runner.recorded()[0];
        assert_eq!(sql, "SELECT \"fn_purge_widgets\"($1::int4) AS purged");
        assert_eq!(params[0], PgParam(json!(30)));
    }
}
