//! Read-path operations: find, one, count, exists, aggregation, and
//! keyset/offset pagination.
//!
//! Every read ANDs the compiled predicate with the soft-delete and
//! freshness scope before ordering; pagination computes the total count
//! from the same filtered set in the same round trip.

use serde_json::Value as JsonValue;

use crate::db::{PgParam, Row, SqlRunner};
use crate::error::RepoError;
use crate::repo::cursor::Cursor;
use crate::repo::predicate::{compile, quote_ident, Predicate};
use crate::repo::{scoped_where, Order, Repo, Scope};
use crate::schema::Entity;

/// Row-locking mode for [`Repo::one`].
///
/// The engine never takes locks implicitly; the caller chooses blocking
/// behavior explicitly. Default is non-locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lock {
    #[default]
    None,
    /// `FOR UPDATE` - blocks until the row lock is available.
    Update,
    /// `FOR SHARE`.
    Share,
    /// `FOR UPDATE NOWAIT` - fails immediately if the row is locked.
    UpdateNoWait,
    /// `FOR UPDATE SKIP LOCKED` - silently skips contended rows.
    UpdateSkipLocked,
}

impl Lock {
    fn sql(self) -> &'static str {
        match self {
            Lock::None => "",
            Lock::Update => " FOR UPDATE",
            Lock::Share => " FOR SHARE",
            Lock::UpdateNoWait => " FOR UPDATE NOWAIT",
            Lock::UpdateSkipLocked => " FOR UPDATE SKIP LOCKED",
        }
    }
}

/// Arguments for keyset pagination.
#[derive(Debug, Clone)]
pub struct PageArgs {
    pub limit: u32,
    /// Encoded cursor from a previous page, if continuing.
    pub cursor: Option<String>,
    pub order: Order,
}

impl Default for PageArgs {
    fn default() -> Self {
        Self {
            limit: 50,
            cursor: None,
            order: Order::Asc,
        }
    }
}

/// Arguments for offset pagination.
#[derive(Debug, Clone)]
pub struct OffsetArgs {
    pub limit: u32,
    pub offset: u64,
    pub order: Order,
}

impl Default for OffsetArgs {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            order: Order::Asc,
        }
    }
}

/// One keyset page: rows, the total count of the filtered set, and
/// whether more rows follow.
#[derive(Debug, Clone)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub total: i64,
    pub has_more: bool,
    /// Cursor for the next page; present only when `has_more`.
    pub next_cursor: Option<String>,
}

/// One offset page.
#[derive(Debug, Clone)]
pub struct OffsetPage<E> {
    pub items: Vec<E>,
    pub total: i64,
    pub has_more: bool,
}

/// Aggregate kind over a target column. Unknown kinds are
/// unrepresentable - the enum is closed.
#[derive(Debug, Clone, Copy)]
pub enum Agg {
    Sum(&'static str),
    Avg(&'static str),
    Min(&'static str),
    Max(&'static str),
    Count(&'static str),
    CountAll,
}

impl Agg {
    fn column(self) -> Option<&'static str> {
        match self {
            Agg::Sum(c) | Agg::Avg(c) | Agg::Min(c) | Agg::Max(c) | Agg::Count(c) => Some(c),
            Agg::CountAll => None,
        }
    }

    fn sql(self) -> String {
        match self {
            Agg::Sum(c) => format!("sum({})", quote_ident(c)),
            Agg::Avg(c) => format!("avg({})", quote_ident(c)),
            Agg::Min(c) => format!("min({})", quote_ident(c)),
            Agg::Max(c) => format!("max({})", quote_ident(c)),
            Agg::Count(c) => format!("count({})", quote_ident(c)),
            Agg::CountAll => "count(*)".to_string(),
        }
    }
}

impl<E: Entity, X: SqlRunner> Repo<E, X> {
    /// Builds the scoped, ordered SELECT for a predicate sequence.
    pub(crate) fn select_sql(
        preds: &[Predicate],
        order: Order,
        scope: Scope,
        lock: Lock,
        limit: Option<u32>,
    ) -> Result<(String, Vec<PgParam>), RepoError> {
        let meta = Self::meta();
        let pk = quote_ident(meta.pk_or_err()?.name);
        let frag = compile(preds, meta, 0)?;
        let mut sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {pk} {}",
            quote_ident(meta.table),
            scoped_where(&frag.sql, meta, scope),
            order.sql(),
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql.push_str(lock.sql());
        Ok((sql, frag.params))
    }

    /// All active rows matching the predicate sequence, ordered by
    /// primary key.
    pub async fn find(&self, preds: &[Predicate], order: Order) -> Result<Vec<E>, RepoError> {
        self.find_scoped(preds, order, Scope::Active).await
    }

    /// Like [`find`](Repo::find), but includes soft-deleted and expired
    /// rows.
    pub async fn find_any(&self, preds: &[Predicate], order: Order) -> Result<Vec<E>, RepoError> {
        self.find_scoped(preds, order, Scope::All).await
    }

    async fn find_scoped(
        &self,
        preds: &[Predicate],
        order: Order,
        scope: Scope,
    ) -> Result<Vec<E>, RepoError> {
        let (sql, params) = Self::select_sql(preds, order, scope, Lock::None, None)?;
        let rows = self.exec().query(&sql, &params).await?;
        rows.into_iter().map(E::decode).collect()
    }

    /// The single matching row, optionally locked.
    ///
    /// Zero rows is [`RepoError::NotFound`] - distinct from a row that
    /// fails to decode.
    pub async fn one(&self, preds: &[Predicate], lock: Lock) -> Result<E, RepoError> {
        self.one_opt(preds, lock).await?.ok_or(RepoError::NotFound)
    }

    /// The single matching row, or `None`.
    pub async fn one_opt(&self, preds: &[Predicate], lock: Lock) -> Result<Option<E>, RepoError> {
        let (sql, params) = Self::select_sql(preds, Order::Asc, Scope::Active, lock, Some(1))?;
        let row = self.exec().query_opt(&sql, &params).await?;
        row.map(E::decode).transpose()
    }

    /// Count of active rows matching the predicate sequence.
    pub async fn count(&self, preds: &[Predicate]) -> Result<i64, RepoError> {
        let meta = Self::meta();
        let frag = compile(preds, meta, 0)?;
        let sql = format!(
            "SELECT count(*) AS count FROM {} WHERE {}",
            quote_ident(meta.table),
            scoped_where(&frag.sql, meta, Scope::Active),
        );
        let row = self
            .exec()
            .query_opt(&sql, &frag.params)
            .await?
            .ok_or_else(|| RepoError::decode("count", "count query returned no row"))?;
        row.get("count")
    }

    /// Whether any active row matches.
    pub async fn exists(&self, preds: &[Predicate]) -> Result<bool, RepoError> {
        let meta = Self::meta();
        let frag = compile(preds, meta, 0)?;
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {}) AS present",
            quote_ident(meta.table),
            scoped_where(&frag.sql, meta, Scope::Active),
        );
        let row = self
            .exec()
            .query_opt(&sql, &frag.params)
            .await?
            .ok_or_else(|| RepoError::decode("present", "exists query returned no row"))?;
        row.get("present")
    }

    /// Aggregates over the filtered, scoped set.
    ///
    /// Returns a row keyed by the given aliases.
    pub async fn agg(
        &self,
        preds: &[Predicate],
        specs: &[(&str, Agg)],
    ) -> Result<Row, RepoError> {
        let meta = Self::meta();
        if specs.is_empty() {
            return Err(RepoError::config("aggregation with no targets"));
        }
        for (_, agg) in specs {
            if let Some(col) = agg.column() {
                if !meta.has_column(col) {
                    return Err(RepoError::config(format!(
                        "unknown column '{col}' on table '{}'",
                        meta.table
                    )));
                }
            }
        }
        let select_list = specs
            .iter()
            .map(|(alias, agg)| format!("{} AS {}", agg.sql(), quote_ident(alias)))
            .collect::<Vec<_>>()
            .join(", ");
        let frag = compile(preds, meta, 0)?;
        let sql = format!(
            "SELECT {select_list} FROM {} WHERE {}",
            quote_ident(meta.table),
            scoped_where(&frag.sql, meta, Scope::Active),
        );
        self.exec()
            .query_opt(&sql, &frag.params)
            .await?
            .ok_or_else(|| RepoError::decode("agg", "aggregate query returned no row"))
    }

    /// Keyset page: seek past the cursor, fetch `limit + 1` rows to learn
    /// whether more follow, and compute the filtered set's total count in
    /// the same statement.
    pub async fn page(&self, preds: &[Predicate], args: PageArgs) -> Result<Page<E>, RepoError> {
        // Reject malformed cursors before any SQL is issued.
        let cursor = args
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()?;

        let meta = Self::meta();
        let pk = quote_ident(meta.pk_or_err()?.name);
        let table = quote_ident(meta.table);
        let frag = compile(preds, meta, 0)?;
        let where_sql = scoped_where(&frag.sql, meta, Scope::Active);
        let mut params = frag.params;

        let seek = match &cursor {
            Some(c) => {
                params.push(PgParam(c.key().clone()));
                let op = match args.order {
                    Order::Asc => ">",
                    Order::Desc => "<",
                };
                format!(" WHERE {pk} {op} ${}", params.len())
            }
            None => String::new(),
        };

        let fetch = args.limit as i64 + 1;
        let order = args.order.sql();
        let sql = format!(
            "WITH filtered AS (SELECT * FROM {table} WHERE {where_sql}), \
             page AS (SELECT * FROM filtered{seek} ORDER BY {pk} {order} LIMIT {fetch}) \
             SELECT (SELECT count(*) FROM filtered) AS total, \
             (SELECT coalesce(jsonb_agg(to_jsonb(p) ORDER BY p.{pk} {order}), '[]'::jsonb) \
             FROM page p) AS rows",
        );

        let row = self
            .exec()
            .query_opt(&sql, &params)
            .await?
            .ok_or_else(|| RepoError::decode("page", "page query returned no row"))?;
        let total: i64 = row.get("total")?;
        let (items, raw) = Self::decode_page_rows(&row, args.limit)?;
        let has_more = raw > args.limit as usize;
        let next_cursor = if has_more {
            Self::page_cursor(&row, args.limit)?
        } else {
            None
        };

        Ok(Page {
            items,
            total,
            has_more,
            next_cursor,
        })
    }

    /// Offset page with the same total-count-in-one-round-trip shape.
    pub async fn page_offset(
        &self,
        preds: &[Predicate],
        args: OffsetArgs,
    ) -> Result<OffsetPage<E>, RepoError> {
        let meta = Self::meta();
        let pk = quote_ident(meta.pk_or_err()?.name);
        let table = quote_ident(meta.table);
        let frag = compile(preds, meta, 0)?;
        let where_sql = scoped_where(&frag.sql, meta, Scope::Active);

        let fetch = args.limit as i64 + 1;
        let order = args.order.sql();
        let sql = format!(
            "WITH filtered AS (SELECT * FROM {table} WHERE {where_sql}), \
             page AS (SELECT * FROM filtered ORDER BY {pk} {order} \
             OFFSET {} LIMIT {fetch}) \
             SELECT (SELECT count(*) FROM filtered) AS total, \
             (SELECT coalesce(jsonb_agg(to_jsonb(p) ORDER BY p.{pk} {order}), '[]'::jsonb) \
             FROM page p) AS rows",
            args.offset,
        );

        let row = self
            .exec()
            .query_opt(&sql, &frag.params)
            .await?
            .ok_or_else(|| RepoError::decode("page", "page query returned no row"))?;
        let total: i64 = row.get("total")?;
        let (items, raw) = Self::decode_page_rows(&row, args.limit)?;

        Ok(OffsetPage {
            items,
            total,
            has_more: raw > args.limit as usize,
        })
    }

    /// Decodes up to `limit` entities out of the page's jsonb row array,
    /// returning the raw fetched count alongside.
    fn decode_page_rows(row: &Row, limit: u32) -> Result<(Vec<E>, usize), RepoError> {
        let raw = row
            .get_raw("rows")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| RepoError::decode("rows", "page query returned no row array"))?;
        let fetched = raw.len();
        let items = raw
            .iter()
            .take(limit as usize)
            .map(|obj| Self::decode_json_row(obj.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, fetched))
    }

    /// Cursor pointing at the last returned row.
    fn page_cursor(row: &Row, limit: u32) -> Result<Option<String>, RepoError> {
        let meta = Self::meta();
        let pk = meta.pk_or_err()?.name;
        let raw = row
            .get_raw("rows")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| RepoError::decode("rows", "page query returned no row array"))?;
        let last = match raw.get(limit.saturating_sub(1) as usize) {
            Some(v) => v,
            None => return Ok(None),
        };
        let key = last
            .get(pk)
            .cloned()
            .ok_or_else(|| RepoError::decode(pk, "page row missing primary key"))?;
        Ok(Some(Cursor::from_key(key).encode()))
    }

    /// Decodes one jsonb-rendered row into the entity.
    pub(crate) fn decode_json_row(obj: JsonValue) -> Result<E, RepoError> {
        match obj {
            JsonValue::Object(map) => E::decode(Row::new(map.into_iter().collect())),
            other => Err(RepoError::decode(
                Self::meta().table,
                format!("expected row object, got {other}"),
            )),
        }
    }
}
