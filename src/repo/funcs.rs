//! Typed invocation of configured stored functions.

use serde_json::Value as JsonValue;

use crate::db::{PgParam, SqlRunner};
use crate::error::RepoError;
use crate::repo::options::FnSpec;
use crate::repo::predicate::quote_ident;
use crate::repo::Repo;
use crate::schema::Entity;

fn call_sql(spec: &FnSpec) -> String {
    let args = spec
        .args
        .iter()
        .enumerate()
        .map(|(i, arg)| match arg.cast {
            Some(cast) => format!("${}::{}", i + 1, cast.sql()),
            None => format!("${}", i + 1),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}({args})", quote_ident(&spec.sql_name))
}

fn check_arity(spec: &FnSpec, name: &str, args: &[JsonValue]) -> Result<(), RepoError> {
    if args.len() != spec.args.len() {
        return Err(RepoError::config(format!(
            "function '{name}' takes {} arguments, got {}",
            spec.args.len(),
            args.len()
        )));
    }
    Ok(())
}

impl<E: Entity, X: SqlRunner> Repo<E, X> {
    /// Invokes a configured scalar-returning function.
    ///
    /// Fails with [`RepoError::UnknownFunction`] for an unregistered
    /// name, and [`RepoError::NoFunctions`] when no functions are
    /// configured at all.
    pub async fn fn_scalar(&self, name: &str, args: &[JsonValue]) -> Result<i64, RepoError> {
        let spec = self.opts().function_or_err(name)?.clone();
        check_arity(&spec, name, args)?;

        let sql = format!("SELECT {} AS value", call_sql(&spec));
        let params: Vec<PgParam> = args.iter().cloned().map(PgParam).collect();
        let row = self
            .exec()
            .query_opt(&sql, &params)
            .await?
            .ok_or_else(|| RepoError::decode("value", "scalar function returned no row"))?;
        row.get("value")
    }

    /// Invokes a configured set-returning function and decodes every row
    /// against the entity schema.
    pub async fn fn_set(&self, name: &str, args: &[JsonValue]) -> Result<Vec<E>, RepoError> {
        let spec = self.opts().function_or_err(name)?.clone();
        check_arity(&spec, name, args)?;

        let sql = format!("SELECT * FROM {}", call_sql(&spec));
        let params: Vec<PgParam> = args.iter().cloned().map(PgParam).collect();
        let rows = self.exec().query(&sql, &params).await?;
        rows.into_iter().map(E::decode).collect()
    }
}
