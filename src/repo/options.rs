//! Declarative per-repository configuration.
//!
//! Constructed once when the repository is built; validated lazily - a
//! missing section surfaces as a typed configuration error only when the
//! corresponding operation is invoked.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::RepoError;
use crate::schema::Cast;

/// Conflict-key configuration for upsert and merge.
#[derive(Debug, Clone)]
pub struct ConflictSpec {
    /// Columns the conflict/match is keyed on.
    pub keys: Vec<String>,
    /// Optional subset of columns the conflict branch updates; all
    /// non-key columns when absent.
    pub update_columns: Option<Vec<String>>,
}

/// Shape of a named batching resolver.
#[derive(Debug, Clone)]
pub enum ResolverSpec {
    /// Point lookup on one field, or a composite of several.
    Single { fields: Vec<String> },
    /// All rows sharing a group key.
    Grouped { field: String },
}

/// Argument of a custom stored function.
#[derive(Debug, Clone, Default)]
pub struct FnArg {
    pub cast: Option<Cast>,
}

/// A registered scalar- or set-returning stored function.
#[derive(Debug, Clone)]
pub struct FnSpec {
    /// Function name as it exists in the database.
    pub sql_name: String,
    pub args: Vec<FnArg>,
}

impl FnSpec {
    pub fn new(sql_name: impl Into<String>, args: Vec<FnArg>) -> Self {
        Self {
            sql_name: sql_name.into(),
            args,
        }
    }
}

/// Declarative configuration for one repository instance.
#[derive(Debug, Clone, Default)]
pub struct RepoOptions {
    conflict: Option<ConflictSpec>,
    resolvers: HashMap<String, ResolverSpec>,
    purge_fn: Option<String>,
    functions: Option<HashMap<String, FnSpec>>,
    resolver_window: Duration,
}

impl RepoOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures conflict keys for upsert/merge.
    pub fn conflict_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.conflict = Some(ConflictSpec {
            keys: keys.into_iter().map(Into::into).collect(),
            update_columns: None,
        });
        self
    }

    /// Restricts which columns the upsert/merge conflict branch updates.
    pub fn conflict_update_columns<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        if let Some(conflict) = &mut self.conflict {
            conflict.update_columns = Some(columns.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Registers a named batching resolver.
    pub fn resolver(mut self, name: impl Into<String>, spec: ResolverSpec) -> Self {
        self.resolvers.insert(name.into(), spec);
        self
    }

    /// Names the retention-purge stored function.
    pub fn purge_fn(mut self, name: impl Into<String>) -> Self {
        self.purge_fn = Some(name.into());
        self
    }

    /// Registers a custom stored function.
    pub fn function(mut self, name: impl Into<String>, spec: FnSpec) -> Self {
        self.functions
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), spec);
        self
    }

    /// Widens the resolver batching window (defaults to one scheduler
    /// tick).
    pub fn resolver_window(mut self, window: Duration) -> Self {
        self.resolver_window = window;
        self
    }

    // Lazy accessors - each checked only when the corresponding
    // operation runs.

    pub(crate) fn conflict_or_err(&self) -> Result<&ConflictSpec, RepoError> {
        self.conflict
            .as_ref()
            .ok_or_else(|| RepoError::config("no conflict keys configured"))
    }

    pub(crate) fn purge_fn_or_err(&self) -> Result<&str, RepoError> {
        self.purge_fn
            .as_deref()
            .ok_or_else(|| RepoError::config("no purge function configured"))
    }

    pub(crate) fn function_or_err(&self, name: &str) -> Result<&FnSpec, RepoError> {
        let functions = self.functions.as_ref().ok_or(RepoError::NoFunctions)?;
        functions
            .get(name)
            .ok_or_else(|| RepoError::UnknownFunction(name.to_string()))
    }

    pub(crate) fn resolver_spec(&self, name: &str) -> Option<&ResolverSpec> {
        self.resolvers.get(name)
    }

    pub(crate) fn resolver_specs(&self) -> impl Iterator<Item = (&String, &ResolverSpec)> {
        self.resolvers.iter()
    }

    pub(crate) fn window(&self) -> Duration {
        self.resolver_window
    }
}
