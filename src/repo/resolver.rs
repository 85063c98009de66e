//! Request-batching resolvers (dataloader pattern).
//!
//! Concurrent point lookups for the same named resolver that arrive
//! within one scheduling window are collected, deduplicated by key, and
//! serviced by exactly one query - `field = ANY(...)` for single-field
//! specs, an OR-of-ANDs for composite specs - then demultiplexed back to
//! each caller. This is how the repository avoids N+1 query patterns when
//! unrelated callers request different keys of the same entity
//! concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::db::{PgParam, Row, SqlRunner};
use crate::error::RepoError;
use crate::repo::options::{RepoOptions, ResolverSpec};
use crate::repo::predicate::quote_ident;
use crate::repo::{scoped_where, Repo, Scope};
use crate::schema::{Entity, TableMeta};

type Waiter<E> = oneshot::Sender<Result<Vec<E>, String>>;

struct PendingKey<E> {
    key: JsonValue,
    waiters: Vec<Waiter<E>>,
}

struct Pending<E> {
    scheduled: bool,
    keys: HashMap<String, PendingKey<E>>,
}

impl<E> Default for Pending<E> {
    fn default() -> Self {
        Self {
            scheduled: false,
            keys: HashMap::new(),
        }
    }
}

struct LoaderInner<E: Entity> {
    exec: Arc<dyn SqlRunner>,
    spec: ResolverSpec,
    window: Duration,
    pending: Mutex<Pending<E>>,
}

/// One named resolver: in-flight request state plus the spec and executor
/// its batches run with. Batches run on their own executor handle, outside
/// any caller transaction.
pub(crate) struct Loader<E: Entity> {
    inner: Arc<LoaderInner<E>>,
}

impl<E: Entity> Loader<E> {
    fn new(exec: Arc<dyn SqlRunner>, spec: ResolverSpec, window: Duration) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                exec,
                spec,
                window,
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    pub(crate) fn spec(&self) -> &ResolverSpec {
        &self.inner.spec
    }

    /// Enqueues a key and waits for its slice of the batch result.
    ///
    /// The key is value-wrapped up front so the dedup key, the query
    /// parameter, and the demux key all agree.
    async fn load(&self, key: JsonValue) -> Result<Vec<E>, RepoError> {
        let key = wrap_request_key(E::meta(), &self.inner.spec, key);
        let (tx, rx) = oneshot::channel();
        let key_str = key.to_string();
        {
            let mut pending = self.inner.pending.lock().expect("resolver state poisoned");
            pending
                .keys
                .entry(key_str)
                .or_insert_with(|| PendingKey {
                    key,
                    waiters: Vec::new(),
                })
                .waiters
                .push(tx);
            if !pending.scheduled {
                pending.scheduled = true;
                tokio::spawn(flush(self.inner.clone()));
            }
        }
        rx.await
            .map_err(|_| RepoError::Resolver("batch task dropped".to_string()))?
            .map_err(RepoError::Resolver)
    }
}

/// Collects the window's requests, runs the single batch query, and fans
/// the grouped result back out.
async fn flush<E: Entity>(inner: Arc<LoaderInner<E>>) {
    tokio::time::sleep(inner.window).await;

    let batch: Vec<(String, PendingKey<E>)> = {
        let mut pending = inner.pending.lock().expect("resolver state poisoned");
        pending.scheduled = false;
        pending.keys.drain().collect()
    };
    if batch.is_empty() {
        return;
    }

    match run_batch(&inner, &batch).await {
        Ok(mut grouped) => {
            for (key_str, entry) in batch {
                let rows = grouped.remove(&key_str).unwrap_or_default();
                for waiter in entry.waiters {
                    let _ = waiter.send(Ok(rows.clone()));
                }
            }
        }
        Err(e) => {
            let message = e.to_string();
            tracing::warn!(error = %message, "resolver batch failed");
            for (_, entry) in batch {
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(message.clone()));
                }
            }
        }
    }
}

async fn run_batch<E: Entity>(
    inner: &LoaderInner<E>,
    batch: &[(String, PendingKey<E>)],
) -> Result<HashMap<String, Vec<E>>, RepoError> {
    let meta = E::meta();
    let table = quote_ident(meta.table);

    let (where_sql, params, key_fields) = match &inner.spec {
        ResolverSpec::Single { fields } if fields.len() == 1 => {
            any_clause(meta, &fields[0], batch)?
        }
        ResolverSpec::Single { fields } => composite_clause(meta, fields, batch)?,
        ResolverSpec::Grouped { field } => any_clause(meta, field, batch)?,
    };

    let sql = format!(
        "SELECT * FROM {table} WHERE {}",
        scoped_where(&where_sql, meta, Scope::Active)
    );
    let rows = inner.exec.query(&sql, &params).await?;

    let mut grouped: HashMap<String, Vec<E>> = HashMap::new();
    for row in rows {
        let key_str = row_key(&row, &key_fields)?;
        grouped.entry(key_str).or_default().push(E::decode(row)?);
    }
    Ok(grouped)
}

/// `field = ANY($1)` over every batched key.
fn any_clause<E>(
    meta: &TableMeta,
    field: &str,
    batch: &[(String, PendingKey<E>)],
) -> Result<(String, Vec<PgParam>, Vec<String>), RepoError> {
    check_field(meta, field)?;
    let keys: Vec<JsonValue> = batch.iter().map(|(_, entry)| entry.key.clone()).collect();
    let cast = match meta.cast_for(field) {
        Some(cast) => format!("::{}[]", cast.sql()),
        None => String::new(),
    };
    Ok((
        format!("{} = ANY($1{cast})", quote_ident(field)),
        vec![PgParam(JsonValue::Array(keys))],
        vec![field.to_string()],
    ))
}

/// OR-of-ANDs over composite keys: `(f1 = $1 AND f2 = $2) OR (...)`.
fn composite_clause<E>(
    meta: &TableMeta,
    fields: &[String],
    batch: &[(String, PendingKey<E>)],
) -> Result<(String, Vec<PgParam>, Vec<String>), RepoError> {
    if fields.is_empty() {
        return Err(RepoError::config("composite resolver has no fields"));
    }
    for field in fields {
        check_field(meta, field)?;
    }
    let mut params = Vec::with_capacity(batch.len() * fields.len());
    let mut clauses = Vec::with_capacity(batch.len());

    for (_, entry) in batch {
        let parts = entry.key.as_array().filter(|p| p.len() == fields.len());
        let parts = parts.ok_or_else(|| {
            RepoError::config(format!(
                "composite resolver key must be a {}-element list",
                fields.len()
            ))
        })?;
        let clause = fields
            .iter()
            .zip(parts)
            .map(|(field, part)| {
                params.push(PgParam(part.clone()));
                let n = params.len();
                match meta.cast_for(field) {
                    Some(cast) => format!("{} = ${n}::{}", quote_ident(field), cast.sql()),
                    None => format!("{} = ${n}", quote_ident(field)),
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        clauses.push(format!("({clause})"));
    }

    Ok((clauses.join(" OR "), params, fields.to_vec()))
}

fn check_field(meta: &TableMeta, field: &str) -> Result<(), RepoError> {
    if !meta.has_column(field) {
        return Err(RepoError::config(format!(
            "unknown resolver field '{field}' on table '{}'",
            meta.table
        )));
    }
    Ok(())
}

/// Applies each field's configured value-wrap to an incoming request key.
fn wrap_request_key(meta: &TableMeta, spec: &ResolverSpec, key: JsonValue) -> JsonValue {
    let wrap_one = |field: &str, value: JsonValue| match meta.wrap_for(field) {
        Some(wrap) => wrap.apply(value),
        None => value,
    };
    match spec {
        ResolverSpec::Single { fields } if fields.len() > 1 => match key {
            JsonValue::Array(parts) => JsonValue::Array(
                fields
                    .iter()
                    .zip(parts)
                    .map(|(field, part)| wrap_one(field, part))
                    .collect(),
            ),
            other => other,
        },
        ResolverSpec::Single { fields } => match fields.first() {
            Some(field) => wrap_one(field, key),
            None => key,
        },
        ResolverSpec::Grouped { field } => wrap_one(field, key),
    }
}

/// Canonical key string of a result row, matching the request keys'
/// encoding.
fn row_key(row: &Row, key_fields: &[String]) -> Result<String, RepoError> {
    let mut values = Vec::with_capacity(key_fields.len());
    for field in key_fields {
        let value = row
            .get_raw(field)
            .cloned()
            .ok_or_else(|| RepoError::decode(field, "resolver row missing key column"))?;
        values.push(value);
    }
    Ok(if values.len() == 1 {
        values.remove(0).to_string()
    } else {
        JsonValue::Array(values).to_string()
    })
}

/// All named resolvers of one repository.
pub(crate) struct LoaderSet<E: Entity> {
    loaders: HashMap<String, Loader<E>>,
}

impl<E: Entity> LoaderSet<E> {
    pub(crate) fn build(exec: Arc<dyn SqlRunner>, opts: &RepoOptions) -> Self {
        let loaders = opts
            .resolver_specs()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    Loader::new(exec.clone(), spec.clone(), opts.window()),
                )
            })
            .collect();
        Self { loaders }
    }

    fn get(&self, name: &str) -> Result<&Loader<E>, RepoError> {
        self.loaders
            .get(name)
            .ok_or_else(|| RepoError::config(format!("unknown resolver '{name}'")))
    }
}

impl<E: Entity, X: SqlRunner> Repo<E, X> {
    /// Batched point lookup through a named single-key resolver.
    ///
    /// Absence is an explicit `None`, never an error. Requests issued
    /// within one scheduling window share a single query.
    pub async fn load(&self, resolver: &str, key: impl Serialize) -> Result<Option<E>, RepoError> {
        let loader = self.loaders().get(resolver)?;
        let key = serde_json::to_value(key).expect("failed to serialize resolver key");
        match loader.spec() {
            ResolverSpec::Grouped { .. } => Err(RepoError::config(format!(
                "resolver '{resolver}' is grouped; use load_grouped"
            ))),
            ResolverSpec::Single { fields } if fields.len() > 1 => {
                let arity_ok = key.as_array().is_some_and(|p| p.len() == fields.len());
                if !arity_ok {
                    return Err(RepoError::config(format!(
                        "resolver '{resolver}' takes a {}-element key",
                        fields.len()
                    )));
                }
                Ok(loader.load(key).await?.into_iter().next())
            }
            ResolverSpec::Single { .. } => Ok(loader.load(key).await?.into_iter().next()),
        }
    }

    /// Batched grouped lookup: every active row sharing the group key,
    /// including the empty group for keys with no matching rows.
    pub async fn load_grouped(
        &self,
        resolver: &str,
        key: impl Serialize,
    ) -> Result<Vec<E>, RepoError> {
        let loader = self.loaders().get(resolver)?;
        match loader.spec() {
            ResolverSpec::Grouped { .. } => {
                let key = serde_json::to_value(key).expect("failed to serialize resolver key");
                loader.load(key).await
            }
            ResolverSpec::Single { .. } => Err(RepoError::config(format!(
                "resolver '{resolver}' is not grouped; use load"
            ))),
        }
    }
}
