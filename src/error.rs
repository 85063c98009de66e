//! Repository error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by repository operations.
///
/// Configuration and malformed-input errors are raised before any SQL is
/// issued. Driver errors pass through typed. Concurrency conflicts and
/// unknown-function lookups get dedicated variants so callers can
/// pattern-match and react differently (retry with fresh data vs. surface
/// a hard failure).
#[derive(Error, Debug)]
pub enum RepoError {
    // Configuration errors - raised before touching the database
    #[error("repository configuration error: {0}")]
    Config(String),

    // Optimistic-concurrency conflict on upsert
    #[error("stale write: row exists but updated_at != {expected}")]
    Stale { expected: DateTime<Utc> },

    // Custom-function dispatch
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("no custom functions configured for this repository")]
    NoFunctions,

    // Read path
    #[error("no matching row")]
    NotFound,

    #[error("malformed cursor: {0}")]
    Cursor(String),

    #[error("failed to decode '{column}': {message}")]
    Decode { column: String, message: String },

    // Driver errors - passed through typed
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    // Batch failures fanned out to resolver waiters; the driver error is
    // not Clone, so waiters receive its message
    #[error("resolver batch failed: {0}")]
    Resolver(String),
}

impl RepoError {
    /// Decode error for a named column.
    pub(crate) fn decode(column: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.to_string(),
        }
    }

    /// Configuration error with a formatted message.
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
