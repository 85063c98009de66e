//! Database access layer.
//!
//! A thin, trait-based layer over tokio-postgres + deadpool:
//!
//! - [`Client`] - pooled client, auto-commit per statement
//! - [`Tx`] - caller-managed transaction with explicit commit/rollback
//! - [`SqlRunner`] - the execution seam both implement; the repository
//!   surface is written once against it
//! - [`Row`] / [`RowStream`] - generic JSON-valued result rows
//! - [`PgParam`] - JSON-carried parameters adapted to wire types at bind
//!   time

mod client;
mod row;
mod traits;
mod value;

pub use client::{Client, Tx};
pub use row::{Row, RowStream};
pub use traits::{SqlRunner, Transaction};
pub use value::PgParam;
