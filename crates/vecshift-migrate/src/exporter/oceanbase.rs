//! OceanBase exporter.
//!
//! OceanBase renders a `VECTOR` column as its `[a,b,...]` literal; some
//! server versions tag it as binary, so both text and bytes are accepted.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{MySql, QueryBuilder, Row};
use std::sync::Arc;
use tracing::debug;
use vecshift_core::connection::ConnectionManager;
use vecshift_core::retry::{with_retry, RetryConfig};
use vecshift_core::store::oceanbase::OceanBaseConnector;
use vecshift_core::types::{BackendKind, VectorRecord};
use vecshift_core::vector_text::parse_vector;
use vecshift_core::Error as StoreError;

use super::{ExportBatch, ExportRequest, Exporter, ScopeFilter};
use crate::error::Result;

/// Columns read for every exported record.
pub const EXPORT_COLUMNS: &str = "id, vector, team_id, dataset_id, collection_id, createtime";

/// `SELECT` for the page after `request.after_id`, one row past the limit.
pub fn export_query<'a>(table: &str, request: &'a ExportRequest) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(format!("SELECT {EXPORT_COLUMNS} FROM {table} WHERE id > "));
    qb.push_bind(request.after_id.unwrap_or(0));
    push_scope(&mut qb, request.team_id.as_deref(), request.dataset_id.as_deref());
    qb.push(" ORDER BY id ASC LIMIT ");
    qb.push_bind(u64::try_from(request.limit.saturating_add(1)).unwrap_or(u64::MAX));
    qb
}

/// `SELECT COUNT(*)` narrowed by `filter`.
pub fn count_query<'a>(table: &str, filter: &'a ScopeFilter) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {table} WHERE 1 = 1"));
    push_scope(&mut qb, filter.team_id.as_deref(), filter.dataset_id.as_deref());
    qb
}

fn push_scope<'a>(qb: &mut QueryBuilder<'a, MySql>, team_id: Option<&'a str>, dataset_id: Option<&'a str>) {
    if let Some(team_id) = team_id {
        qb.push(" AND team_id = ");
        qb.push_bind(team_id);
    }
    if let Some(dataset_id) = dataset_id {
        qb.push(" AND dataset_id = ");
        qb.push_bind(dataset_id);
    }
}

fn vector_text(row: &MySqlRow) -> vecshift_core::Result<String> {
    if let Ok(text) = row.try_get::<String, _>("vector") {
        return Ok(text);
    }
    let bytes: Vec<u8> = row.try_get("vector")?;
    String::from_utf8(bytes)
        .map_err(|e| StoreError::DataCorruption(format!("vector column is not text: {e}")))
}

/// Decodes one exported row.
pub fn decode_row(row: &MySqlRow) -> vecshift_core::Result<(i64, VectorRecord)> {
    let id: i64 = row.try_get("id")?;
    let created: Option<NaiveDateTime> = row.try_get("createtime")?;
    let record = VectorRecord {
        id: id.to_string(),
        vector: parse_vector(&vector_text(row)?)?,
        team_id: row.try_get("team_id")?,
        dataset_id: row.try_get("dataset_id")?,
        collection_id: row.try_get("collection_id")?,
        create_time: created.map_or_else(Utc::now, |value| value.and_utc()),
    };
    Ok((id, record))
}

/// Reads an OceanBase table page by page.
pub struct OceanBaseExporter {
    manager: Arc<ConnectionManager<OceanBaseConnector>>,
    table: String,
    retry: RetryConfig,
    owns_connection: bool,
}

impl OceanBaseExporter {
    /// Creates an exporter sharing `manager`.
    pub fn new(
        manager: Arc<ConnectionManager<OceanBaseConnector>>,
        table: String,
        retry: RetryConfig,
    ) -> Self {
        Self {
            manager,
            table,
            retry,
            owns_connection: false,
        }
    }

    /// Closes the manager together with the exporter.
    #[must_use]
    pub fn owning(mut self) -> Self {
        self.owns_connection = true;
        self
    }

    async fn fetch_page(&self, request: &ExportRequest) -> vecshift_core::Result<Vec<(i64, VectorRecord)>> {
        let table = &self.table;
        self.manager
            .run(|pool| async move {
                let mut qb = export_query(table, request);
                let rows = qb.build().fetch_all(&pool).await?;
                rows.iter().map(decode_row).collect()
            })
            .await
    }
}

#[async_trait]
impl Exporter for OceanBaseExporter {
    fn kind(&self) -> BackendKind {
        BackendKind::OceanBase
    }

    async fn count(&self, filter: &ScopeFilter) -> Result<u64> {
        let table = &self.table;
        let count = self
            .manager
            .run(|pool| async move {
                let mut qb = count_query(table, filter);
                let count: i64 = qb.build_query_scalar().fetch_one(&pool).await?;
                Ok(u64::try_from(count).unwrap_or_default())
            })
            .await?;
        Ok(count)
    }

    async fn export_batch(&self, request: &ExportRequest) -> Result<ExportBatch> {
        let rows =
            with_retry(&self.retry, "oceanbase export_batch", || self.fetch_page(request)).await?;
        let batch = ExportBatch::from_rows(rows, request.limit);
        debug!(
            after_id = ?request.after_id,
            records = batch.records.len(),
            has_more = batch.has_more,
            "oceanbase batch exported"
        );
        Ok(batch)
    }

    async fn export_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VectorRecord>> {
        let sql = format!(
            "SELECT {EXPORT_COLUMNS} FROM {} WHERE createtime BETWEEN ? AND ? ORDER BY id ASC",
            self.table
        );
        let records = self
            .manager
            .run(|pool| async move {
                let rows = sqlx::query(&sql)
                    .bind(start.naive_utc())
                    .bind(end.naive_utc())
                    .fetch_all(&pool)
                    .await?;
                rows.iter()
                    .map(|row| decode_row(row).map(|(_, record)| record))
                    .collect()
            })
            .await?;
        Ok(records)
    }

    async fn close(&self) -> Result<()> {
        if self.owns_connection {
            self.manager.close().await;
        }
        Ok(())
    }
}
