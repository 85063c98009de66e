//! Core traits for database access.
//!
//! This module defines the seams the repository engine is written against:
//!
//! - [`SqlRunner`] - statement execution, implemented by both the pooled
//!   [`Client`](crate::db::Client) and an open [`Tx`](crate::db::Tx)
//! - [`Transaction`] - transaction lifecycle management

use async_trait::async_trait;

use crate::db::row::{Row, RowStream};
use crate::db::value::PgParam;
use crate::error::RepoError;

/// Executes parameterized SQL statements.
///
/// Every repository operation lowers to calls on this trait, so the same
/// operation surface runs against a pooled connection (auto-commit per
/// statement) or inside a caller-managed transaction.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    /// Executes a query and collects all result rows.
    async fn query(&self, sql: &str, params: &[PgParam]) -> Result<Vec<Row>, RepoError>;

    /// Executes a query expected to return at most one row.
    async fn query_opt(&self, sql: &str, params: &[PgParam]) -> Result<Option<Row>, RepoError>;

    /// Executes a statement and returns the affected-row count.
    async fn execute(&self, sql: &str, params: &[PgParam]) -> Result<u64, RepoError>;

    /// Executes a query and returns a stream of result rows.
    ///
    /// Rows are fetched on demand via the driver's portal support;
    /// dropping the stream releases the underlying cursor.
    async fn query_stream(
        &self,
        sql: &str,
        params: Vec<PgParam>,
    ) -> Result<RowStream<'_>, RepoError>;
}

#[async_trait]
impl<T: SqlRunner + ?Sized> SqlRunner for &T {
    async fn query(&self, sql: &str, params: &[PgParam]) -> Result<Vec<Row>, RepoError> {
        (**self).query(sql, params).await
    }

    async fn query_opt(&self, sql: &str, params: &[PgParam]) -> Result<Option<Row>, RepoError> {
        (**self).query_opt(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[PgParam]) -> Result<u64, RepoError> {
        (**self).execute(sql, params).await
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: Vec<PgParam>,
    ) -> Result<RowStream<'_>, RepoError> {
        (**self).query_stream(sql, params).await
    }
}

#[async_trait]
impl<T: SqlRunner + ?Sized> SqlRunner for std::sync::Arc<T> {
    async fn query(&self, sql: &str, params: &[PgParam]) -> Result<Vec<Row>, RepoError> {
        (**self).query(sql, params).await
    }

    async fn query_opt(&self, sql: &str, params: &[PgParam]) -> Result<Option<Row>, RepoError> {
        (**self).query_opt(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[PgParam]) -> Result<u64, RepoError> {
        (**self).execute(sql, params).await
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: Vec<PgParam>,
    ) -> Result<RowStream<'_>, RepoError> {
        (**self).query_stream(sql, params).await
    }
}

/// Transaction lifecycle management.
///
/// Separate from [`SqlRunner`] so the repository surface stays identical
/// inside and outside a transaction; only the lifecycle differs.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Commits the transaction, making all changes permanent.
    ///
    /// Consumes the transaction - it cannot be used after commit.
    async fn commit(self) -> Result<(), RepoError>;

    /// Rolls back the transaction, discarding all changes.
    ///
    /// Consumes the transaction - it cannot be used after rollback.
    async fn rollback(self) -> Result<(), RepoError>;
}
