//! Entity schema metadata - the boundary with the schema collaborator.
//!
//! Entities are plain serde types; [`TableMeta`] carries the per-column
//! capability tags the engine consults everywhere else: primary-key
//! generation strategy, soft-delete marker, freshness/expiry marker,
//! auto-touch-on-update column, and the predicate cast/wrap defaults used
//! during fragment compilation.
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     email: String,
//!     profile: serde_json::Value,
//!     updated_at: Option<DateTime<Utc>>,
//!     deleted_at: Option<DateTime<Utc>>,
//! }
//!
//! static USER_META: TableMeta = TableMeta {
//!     table: "users",
//!     fields: &[
//!         FieldMeta::new("id").pk(PkStrategy::Ulid),
//!         FieldMeta::new("email").wrap(Wrap::Lower),
//!         FieldMeta::new("profile").cast(Cast::Jsonb),
//!         FieldMeta::new("updated_at").cast(Cast::Timestamptz).touch(),
//!         FieldMeta::new("deleted_at").cast(Cast::Timestamptz).soft_delete(),
//!     ],
//! };
//!
//! impl Entity for User {
//!     fn meta() -> &'static TableMeta {
//!         &USER_META
//!     }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::db::Row;
use crate::error::RepoError;

/// How a primary key value is produced on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkStrategy {
    /// The caller supplies the key.
    Provided,
    /// A ULID is generated client-side when the payload carries none.
    /// ULIDs are lexicographically time-ordered, which is what keyset
    /// pagination and the timestamp-bound predicates rely on.
    Ulid,
    /// The key column is omitted from the insert when absent; the
    /// database default produces it.
    DbDefault,
}

/// SQL cast applied to a parameter placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cast {
    Uuid,
    Timestamptz,
    Jsonb,
    BigInt,
    Text,
}

impl Cast {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Cast::Uuid => "uuid",
            Cast::Timestamptz => "timestamptz",
            Cast::Jsonb => "jsonb",
            Cast::BigInt => "int8",
            Cast::Text => "text",
        }
    }
}

/// Value-wrapping function applied to predicate values before binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrap {
    Lower,
    Upper,
}

impl Wrap {
    /// Applies the wrap to a JSON value client-side. Strings are
    /// transformed directly; arrays element-wise (for `In` lists).
    pub(crate) fn apply(self, value: serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(match self {
                Wrap::Lower => s.to_lowercase(),
                Wrap::Upper => s.to_uppercase(),
            }),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.apply(v)).collect())
            }
            other => other,
        }
    }
}

/// Per-column capability tags.
#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub pk: Option<PkStrategy>,
    pub soft_delete: bool,
    pub expiry: bool,
    pub touch: bool,
    pub cast: Option<Cast>,
    pub wrap: Option<Wrap>,
}

impl FieldMeta {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            pk: None,
            soft_delete: false,
            expiry: false,
            touch: false,
            cast: None,
            wrap: None,
        }
    }

    /// Marks this column as the primary key.
    pub const fn pk(mut self, strategy: PkStrategy) -> Self {
        self.pk = Some(strategy);
        self
    }

    /// Marks this column as the soft-delete timestamp.
    pub const fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Marks this column as the freshness/expiry timestamp.
    pub const fn expiry(mut self) -> Self {
        self.expiry = true;
        self
    }

    /// Marks this column as auto-touched on every update.
    pub const fn touch(mut self) -> Self {
        self.touch = true;
        self
    }

    /// Default cast for predicate values against this column.
    pub const fn cast(mut self, cast: Cast) -> Self {
        self.cast = Some(cast);
        self
    }

    /// Default value-wrap for predicate values against this column.
    pub const fn wrap(mut self, wrap: Wrap) -> Self {
        self.wrap = Some(wrap);
        self
    }
}

/// Table-level schema metadata: name plus the insert projection.
#[derive(Debug)]
pub struct TableMeta {
    pub table: &'static str,
    pub fields: &'static [FieldMeta],
}

impl TableMeta {
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// The primary-key column, if one is tagged.
    pub fn pk(&self) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.pk.is_some())
    }

    pub(crate) fn pk_or_err(&self) -> Result<&FieldMeta, RepoError> {
        self.pk().ok_or_else(|| {
            RepoError::config(format!("table '{}' has no primary-key column", self.table))
        })
    }

    pub fn soft_delete_col(&self) -> Option<&'static str> {
        self.fields.iter().find(|f| f.soft_delete).map(|f| f.name)
    }

    pub fn expiry_col(&self) -> Option<&'static str> {
        self.fields.iter().find(|f| f.expiry).map(|f| f.name)
    }

    pub fn touch_col(&self) -> Option<&'static str> {
        self.fields.iter().find(|f| f.touch).map(|f| f.name)
    }

    pub fn cast_for(&self, name: &str) -> Option<Cast> {
        self.field(name).and_then(|f| f.cast)
    }

    pub fn wrap_for(&self, name: &str) -> Option<Wrap> {
        self.field(name).and_then(|f| f.wrap)
    }
}

/// A persistable entity tied to its table metadata.
///
/// Decode goes through serde over the generic JSON [`Row`]; the default
/// implementation covers any entity whose field names match its columns.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn meta() -> &'static TableMeta;

    /// Decodes a result row into the entity.
    fn decode(row: Row) -> Result<Self, RepoError> {
        serde_json::from_value(row.into_json())
            .map_err(|e| RepoError::decode(Self::meta().table, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static META: TableMeta = TableMeta {
        table: "things",
        fields: &[
            FieldMeta::new("id").pk(PkStrategy::Ulid),
            FieldMeta::new("email").wrap(Wrap::Lower),
            FieldMeta::new("owner_id").cast(Cast::Uuid),
            FieldMeta::new("updated_at").cast(Cast::Timestamptz).touch(),
            FieldMeta::new("deleted_at").cast(Cast::Timestamptz).soft_delete(),
            FieldMeta::new("expires_at").cast(Cast::Timestamptz).expiry(),
        ],
    };

    #[test]
    fn test_capability_lookups() {
        assert_eq!(META.pk().unwrap().name, "id");
        assert_eq!(META.soft_delete_col(), Some("deleted_at"));
        assert_eq!(META.expiry_col(), Some("expires_at"));
        assert_eq!(META.touch_col(), Some("updated_at"));
        assert_eq!(META.cast_for("owner_id"), Some(Cast::Uuid));
        assert_eq!(META.wrap_for("email"), Some(Wrap::Lower));
        assert_eq!(META.cast_for("email"), None);
        assert!(!META.has_column("nope"));
    }

    #[test]
    fn test_wrap_applies_to_strings_and_arrays() {
        use serde_json::json;
        assert_eq!(Wrap::Lower.apply(json!("AbC")), json!("abc"));
        assert_eq!(Wrap::Upper.apply(json!(["a", "B"])), json!(["A", "B"]));
        assert_eq!(Wrap::Lower.apply(json!(7)), json!(7));
    }
}
