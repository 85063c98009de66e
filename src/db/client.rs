//! Pooled PostgreSQL client and caller-managed transactions.
//!
//! Connection pooling via deadpool-postgres. The client executes each
//! statement on a pooled connection (auto-commit); [`Client::begin`] hands
//! out an explicit [`Tx`] that must be committed or rolled back by the
//! caller - the engine never opens a transaction on its own.

use std::future::Future;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::TryStreamExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::config::DbConfig;
use crate::db::row::{parse_pg_row, Row, RowStream};
use crate::db::traits::{SqlRunner, Transaction};
use crate::db::value::PgParam;
use crate::error::RepoError;

fn param_refs(params: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Pooled PostgreSQL client.
///
/// This type is cheap to clone - the underlying connection pool is
/// `Arc`-based.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    /// Creates a new client with connection pooling.
    pub async fn connect(config: &DbConfig) -> Result<Self, RepoError> {
        let pg_config: tokio_postgres::Config = config
            .uri
            .parse()
            .map_err(|e| RepoError::Pool(format!("invalid connection string: {e}")))?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| RepoError::Pool(format!("failed to create connection pool: {e}")))?;

        Ok(Self { pool })
    }

    /// Wraps an existing deadpool pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// Gets a connection from the pool.
    async fn conn(&self) -> Result<Object, RepoError> {
        self.pool
            .get()
            .await
            .map_err(|e| RepoError::Pool(format!("failed to get connection from pool: {e}")))
    }

    /// Begins a new caller-managed transaction.
    pub async fn begin(&self) -> Result<Tx, RepoError> {
        let conn = self.conn().await?;
        conn.batch_execute("BEGIN").await?;
        Ok(Tx {
            conn,
            finished: false,
        })
    }

    /// Executes a closure within a transaction.
    ///
    /// The closure receives the transaction and is responsible for calling
    /// `commit()` or `rollback()`; returning without committing leaves the
    /// changes to be rolled back when the connection is recycled.
    pub async fn transaction<F, R, Fut>(&self, f: F) -> Result<R, RepoError>
    where
        F: FnOnce(Tx) -> Fut,
        Fut: Future<Output = Result<R, RepoError>>,
    {
        let tx = self.begin().await?;
        f(tx).await
    }
}

#[async_trait]
impl SqlRunner for Client {
    async fn query(&self, sql: &str, params: &[PgParam]) -> Result<Vec<Row>, RepoError> {
        tracing::debug!(sql, "query");
        let conn = self.conn().await?;
        let rows = conn.query(sql, &param_refs(params)).await?;
        Ok(rows.iter().map(parse_pg_row).collect())
    }

    async fn query_opt(&self, sql: &str, params: &[PgParam]) -> Result<Option<Row>, RepoError> {
        tracing::debug!(sql, "query_opt");
        let conn = self.conn().await?;
        let row = conn.query_opt(sql, &param_refs(params)).await?;
        Ok(row.as_ref().map(parse_pg_row))
    }

    async fn execute(&self, sql: &str, params: &[PgParam]) -> Result<u64, RepoError> {
        tracing::debug!(sql, "execute");
        let conn = self.conn().await?;
        Ok(conn.execute(sql, &param_refs(params)).await?)
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: Vec<PgParam>,
    ) -> Result<RowStream<'_>, RepoError> {
        use async_stream::try_stream;

        tracing::debug!(sql, "query_stream");
        let conn = self.conn().await?;
        let sql = sql.to_string();

        // The connection is captured by the generator and kept alive for
        // the stream's lifetime; dropping the stream returns it to the
        // pool, which releases the server-side portal.
        Ok(Box::pin(try_stream! {
            let refs = params.iter().map(|p| p as &dyn ToSql);
            let stream = conn.query_raw(&sql, refs).await.map_err(RepoError::Db)?;
            futures::pin_mut!(stream);
            while let Some(pg_row) = stream.try_next().await.map_err(RepoError::Db)? {
                yield parse_pg_row(&pg_row);
            }
        }))
    }
}

/// An open PostgreSQL transaction on a pooled connection.
///
/// Must be explicitly committed or rolled back; dropping without either
/// logs a warning and the connection is recycled with the transaction
/// aborted.
pub struct Tx {
    conn: Object,
    finished: bool,
}

#[async_trait]
impl SqlRunner for Tx {
    async fn query(&self, sql: &str, params: &[PgParam]) -> Result<Vec<Row>, RepoError> {
        tracing::debug!(sql, "tx query");
        let rows = self.conn.query(sql, &param_refs(params)).await?;
        Ok(rows.iter().map(parse_pg_row).collect())
    }

    async fn query_opt(&self, sql: &str, params: &[PgParam]) -> Result<Option<Row>, RepoError> {
        tracing::debug!(sql, "tx query_opt");
        let row = self.conn.query_opt(sql, &param_refs(params)).await?;
        Ok(row.as_ref().map(parse_pg_row))
    }

    async fn execute(&self, sql: &str, params: &[PgParam]) -> Result<u64, RepoError> {
        tracing::debug!(sql, "tx execute");
        Ok(self.conn.execute(sql, &param_refs(params)).await?)
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: Vec<PgParam>,
    ) -> Result<RowStream<'_>, RepoError> {
        tracing::debug!(sql, "tx query_stream");
        let refs = params.iter().map(|p| p as &dyn ToSql);
        let stream = self.conn.query_raw(sql, refs).await?;
        Ok(Box::pin(
            stream
                .map_ok(|pg_row| parse_pg_row(&pg_row))
                .map_err(RepoError::Db),
        ))
    }
}

#[async_trait]
impl Transaction for Tx {
    async fn commit(mut self) -> Result<(), RepoError> {
        self.finished = true;
        self.conn.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), RepoError> {
        self.finished = true;
        self.conn.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("transaction dropped without commit or rollback");
        }
    }
}
