//! Shared fixtures for repository unit tests: a mock executor that
//! records statements and serves canned rows, plus a small entity.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::db::{PgParam, Row, RowStream, SqlRunner};
use crate::error::RepoError;
use crate::schema::{Cast, Entity, FieldMeta, PkStrategy, TableMeta};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct Widget {
    pub id: String,
    pub name: String,
    pub status: String,
    pub count: i64,
    pub tags: JsonValue,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub(crate) static WIDGET_META: TableMeta = TableMeta {
    table: "widgets",
    fields: &[
        FieldMeta::new("id").pk(PkStrategy::Ulid),
        FieldMeta::new("name"),
        FieldMeta::new("status"),
        FieldMeta::new("count"),
        FieldMeta::new("tags").cast(Cast::Jsonb),
        FieldMeta::new("updated_at").cast(Cast::Timestamptz).touch(),
        FieldMeta::new("deleted_at").cast(Cast::Timestamptz).soft_delete(),
        FieldMeta::new("expires_at").cast(Cast::Timestamptz).expiry(),
    ],
};

impl Entity for Widget {
    fn meta() -> &'static TableMeta {
        &WIDGET_META
    }
}

pub(crate) fn widget(id: &str, name: &str) -> Widget {
    Widget {
        id: id.to_string(),
        name: name.to_string(),
        status: "active".to_string(),
        count: 0,
        tags: serde_json::json!({}),
        updated_at: None,
        deleted_at: None,
        expires_at: None,
    }
}

pub(crate) fn widget_row(w: &Widget) -> Row {
    let JsonValue::Object(map) = serde_json::to_value(w).unwrap() else {
        unreachable!("widget serializes to an object");
    };
    Row::new(map.into_iter().collect())
}

/// Records every statement and serves queued results in order.
#[derive(Default)]
pub(crate) struct MockRunner {
    pub calls: Mutex<Vec<(String, Vec<PgParam>)>>,
    pub results: Mutex<VecDeque<Vec<Row>>>,
    pub exec_results: Mutex<VecDeque<u64>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rows(&self, rows: Vec<Row>) {
        self.results.lock().unwrap().push_back(rows);
    }

    pub fn push_count(&self, count: u64) {
        self.exec_results.lock().unwrap().push_back(count);
    }

    pub fn recorded(&self) -> Vec<(String, Vec<PgParam>)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, sql: &str, params: &[PgParam]) {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
    }

    fn next_rows(&self) -> Vec<Row> {
        self.results.lock().unwrap().pop_front().unwrap_or_default()
    }
}

#[async_trait]
impl SqlRunner for MockRunner {
    async fn query(&self, sql: &str, params: &[PgParam]) -> Result<Vec<Row>, RepoError> {
        self.record(sql, params);
        Ok(self.next_rows())
    }

    async fn query_opt(&self, sql: &str, params: &[PgParam]) -> Result<Option<Row>, RepoError> {
        self.record(sql, params);
        Ok(self.next_rows().into_iter().next())
    }

    async fn execute(&self, sql: &str, params: &[PgParam]) -> Result<u64, RepoError> {
        self.record(sql, params);
        Ok(self.exec_results.lock().unwrap().pop_front().unwrap_or(0))
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: Vec<PgParam>,
    ) -> Result<RowStream<'_>, RepoError> {
        self.record(sql, &params);
        let rows = self.next_rows();
        Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
    }
}
