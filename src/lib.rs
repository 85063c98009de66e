//! Relata - Generic Typed Repository Engine for PostgreSQL
//!
//! Given an entity's schema metadata and a declarative per-repository
//! configuration, [`Repo`](repo::Repo) produces the full persistence
//! surface - point and bulk lookup, predicate-filtered queries,
//! keyset/offset pagination, aggregation, conditional mutation,
//! upsert/merge with action tracking, streaming, batching resolvers, and
//! custom stored-function dispatch - without hand-written SQL per entity.

pub mod config;
pub mod db;
pub mod error;
pub mod repo;
pub mod schema;

pub use config::{Config, DbConfig};
pub use db::{Client, Tx};
pub use error::RepoError;
pub use repo::{Repo, RepoOptions};
pub use schema::{Entity, FieldMeta, TableMeta};
