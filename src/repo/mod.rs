//! The repository engine.
//!
//! A [`Repo`] is produced once per entity type from a [`Client`] and a
//! declarative [`RepoOptions`], and exposes the full persistence surface -
//! reads, pagination, aggregation, mutation, upsert/merge, streaming,
//! batching resolvers, and custom stored-function dispatch - without
//! hand-written SQL per entity.
//!
//! ```ignore
//! let users: Repo<User> = Repo::new(client.clone(), RepoOptions::new()
//!     .conflict_keys(["tenant_id", "email"])
//!     .resolver("by_email", ResolverSpec::Single { fields: vec!["email".into()] }));
//!
//! let page = users.page(&[Predicate::eq("status", "active")], PageArgs::default()).await?;
//!
//! // Inside a caller-managed transaction the surface is identical:
//! let tx = client.begin().await?;
//! users.within(&tx).set_one(Target::key("01J..."), change("name", UpdateOp::value("x"))).await?;
//! tx.commit().await?;
//! ```

mod cursor;
mod funcs;
mod options;
mod predicate;
mod read;
mod resolver;
mod stream;
mod update;
mod write;

pub use cursor::Cursor;
pub use options::{ConflictSpec, FnArg, FnSpec, RepoOptions, ResolverSpec};
pub use predicate::{compile, Fragment, Op, Predicate};
pub use read::{Agg, Lock, OffsetArgs, OffsetPage, Page, PageArgs};
pub use stream::EntityStream;
pub use update::{change, Changes, UpdateOp};
pub use write::{MergeOutcome, Merged, Occ, Target};

use std::marker::PhantomData;
use std::sync::Arc;

use crate::db::{Client, SqlRunner, Tx};
use crate::schema::{Entity, TableMeta};

use predicate::quote_ident;
use resolver::LoaderSet;

/// Row ordering by primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// Read-path row scoping.
///
/// `Active` excludes soft-deleted and expired rows; `All` is the explicit
/// lift for callers that need to see everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Active,
    All,
}

/// ANDs the soft-delete/freshness scope conditions onto a compiled
/// predicate.
pub(crate) fn scoped_where(pred_sql: &str, meta: &TableMeta, scope: Scope) -> String {
    let mut parts = vec![format!("({pred_sql})")];
    if scope == Scope::Active {
        if let Some(col) = meta.soft_delete_col() {
            parts.push(format!("{} IS NULL", quote_ident(col)));
        }
        if let Some(col) = meta.expiry_col() {
            let col = quote_ident(col);
            parts.push(format!("({col} IS NULL OR {col} > now())"));
        }
    }
    parts.join(" AND ")
}

/// Type-checked persistence operations for one entity table.
///
/// Generic over the executor so the same surface runs on the pooled
/// [`Client`] or, via [`Repo::within`], inside a caller-managed
/// transaction.
pub struct Repo<E: Entity, X: SqlRunner = Client> {
    exec: X,
    opts: Arc<RepoOptions>,
    loaders: Arc<LoaderSet<E>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity, X: SqlRunner + Clone + 'static> Repo<E, X> {
    /// Builds a repository over an executor.
    ///
    /// Batching resolvers are constructed here and keep their own handle
    /// to the executor: batches always run outside any caller
    /// transaction, since they aggregate requests across callers.
    pub fn new(exec: X, opts: RepoOptions) -> Self {
        let opts = Arc::new(opts);
        let loaders = Arc::new(LoaderSet::build(
            Arc::new(exec.clone()) as Arc<dyn SqlRunner>,
            &opts,
        ));
        Self {
            exec,
            opts,
            loaders,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity, X: SqlRunner> Repo<E, X> {
    /// Rebinds the operation surface to an open transaction.
    pub fn within<'t>(&self, tx: &'t Tx) -> Repo<E, &'t Tx> {
        Repo {
            exec: tx,
            opts: self.opts.clone(),
            loaders: self.loaders.clone(),
            _entity: PhantomData,
        }
    }

    pub(crate) fn meta() -> &'static TableMeta {
        E::meta()
    }

    pub(crate) fn exec(&self) -> &X {
        &self.exec
    }

    pub(crate) fn opts(&self) -> &RepoOptions {
        &self.opts
    }

    pub(crate) fn loaders(&self) -> &LoaderSet<E> {
        &self.loaders
    }
}

#[cfg(test)]
pub(crate) mod testutil;
