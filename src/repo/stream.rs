//! Lazy streaming over the filtered, scoped, ordered result set.

use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::db::SqlRunner;
use crate::error::RepoError;
use crate::repo::predicate::Predicate;
use crate::repo::read::Lock;
use crate::repo::{Order, Repo, Scope};
use crate::schema::Entity;

/// A pull-based stream of decoded entities.
pub type EntityStream<'a, E> =
    Pin<Box<dyn Stream<Item = Result<E, RepoError>> + Send + 'a>>;

impl<E: Entity, X: SqlRunner> Repo<E, X> {
    /// Opens a server-side cursor over the filtered, scoped, ordered set
    /// and decodes each row as the consumer pulls.
    ///
    /// A decode failure on one row yields an `Err` element without
    /// affecting rows already emitted or still to come. Dropping the
    /// stream early releases the underlying cursor.
    pub async fn stream(
        &self,
        preds: &[Predicate],
        order: Order,
    ) -> Result<EntityStream<'_, E>, RepoError> {
        let (sql, params) = Self::select_sql(preds, order, Scope::Active, Lock::None, None)?;
        let rows = self.exec().query_stream(&sql, params).await?;
        Ok(Box::pin(rows.map(|row| row.and_then(E::decode))))
    }
}
