//! Milvus exporter.
//!
//! `query` filters `id > cursor` on the server; rows come back in segment
//! order, so each page is sorted by id before trimming.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use vecshift_core::connection::ConnectionManager;
use vecshift_core::retry::{with_retry, RetryConfig};
use vecshift_core::store::milvus::{
    id_field, quote, string_field, MilvusConnector, FIELD_COLLECTION_ID, FIELD_CREATE_TIME,
    FIELD_DATASET_ID, FIELD_ID, FIELD_TEAM_ID, FIELD_VECTOR, MAX_QUERY_WINDOW,
};
use vecshift_core::types::{BackendKind, VectorRecord};
use vecshift_core::Error as StoreError;

use super::{ExportBatch, ExportRequest, Exporter, ScopeFilter};
use crate::error::Result;

/// Fields read for every exported entity.
pub const EXPORT_FIELDS: [&str; 6] = [
    FIELD_ID,
    FIELD_VECTOR,
    FIELD_TEAM_ID,
    FIELD_DATASET_ID,
    FIELD_COLLECTION_ID,
    FIELD_CREATE_TIME,
];

/// Expression selecting ids above `after_id` inside a scope.
#[must_use]
pub fn id_filter(after_id: Option<i64>, team_id: Option<&str>, dataset_id: Option<&str>) -> String {
    let mut expr = format!("{FIELD_ID} > {}", after_id.unwrap_or(0));
    if let Some(team_id) = team_id {
        expr.push_str(&format!(" and {FIELD_TEAM_ID} == {}", quote(team_id)));
    }
    if let Some(dataset_id) = dataset_id {
        expr.push_str(&format!(" and {FIELD_DATASET_ID} == {}", quote(dataset_id)));
    }
    expr
}

/// Expression matching every entity of a scope.
#[must_use]
pub fn scope_filter(filter: &ScopeFilter) -> String {
    id_filter(None, filter.team_id.as_deref(), filter.dataset_id.as_deref())
}

/// Decodes one entity returned by `query`.
pub fn decode_entity(row: &Value) -> vecshift_core::Result<(i64, VectorRecord)> {
    let id = id_field(row)?;
    let vector = row
        .get(FIELD_VECTOR)
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::DataCorruption(format!("milvus entity {id} has no vector")))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| StoreError::DataCorruption(format!("milvus entity {id}: bad vector element {v}")))
        })
        .collect::<vecshift_core::Result<Vec<f32>>>()?;
    let create_time = row
        .get(FIELD_CREATE_TIME)
        .and_then(Value::as_i64)
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let record = VectorRecord {
        id: id.to_string(),
        vector,
        team_id: string_field(row, FIELD_TEAM_ID)?,
        dataset_id: string_field(row, FIELD_DATASET_ID)?,
        collection_id: string_field(row, FIELD_COLLECTION_ID)?,
        create_time,
    };
    Ok((id, record))
}

fn decode_sorted(rows: &[Value]) -> vecshift_core::Result<Vec<(i64, VectorRecord)>> {
    let mut decoded = rows.iter().map(decode_entity).collect::<vecshift_core::Result<Vec<_>>>()?;
    decoded.sort_by_key(|(id, _)| *id);
    Ok(decoded)
}

/// Reads a Milvus collection page by page.
pub struct MilvusExporter {
    manager: Arc<ConnectionManager<MilvusConnector>>,
    collection: String,
    retry: RetryConfig,
    owns_connection: bool,
}

impl MilvusExporter {
    /// Creates an exporter sharing `manager`.
    pub fn new(
        manager: Arc<ConnectionManager<MilvusConnector>>,
        collection: String,
        retry: RetryConfig,
    ) -> Self {
        Self {
            manager,
            collection,
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
        let filter = id_filter(
            request.after_id,
            request.team_id.as_deref(),
            request.dataset_id.as_deref(),
        );
        let limit = request.limit.saturating_add(1).min(MAX_QUERY_WINDOW);
        let collection = &self.collection;
        self.manager
            .run(|client| async move {
                let rows = client
                    .query(collection, &filter, &EXPORT_FIELDS, Some(limit))
                    .await?;
                decode_sorted(&rows)
            })
            .await
    }
}

#[async_trait]
impl Exporter for MilvusExporter {
    fn kind(&self) -> BackendKind {
        BackendKind::Milvus
    }

    async fn count(&self, filter: &ScopeFilter) -> Result<u64> {
        let expr = scope_filter(filter);
        let collection = &self.collection;
        let count = self
            .manager
            .run(|client| async move { client.count(collection, &expr).await })
            .await?;
        Ok(count)
    }

    async fn export_batch(&self, request: &ExportRequest) -> Result<ExportBatch> {
        let rows =
            with_retry(&self.retry, "milvus export_batch", || self.fetch_page(request)).await?;
        let batch = ExportBatch::from_rows(rows, request.limit);
        debug!(
            after_id = ?request.after_id,
            records = batch.records.len(),
            has_more = batch.has_more,
            "milvus batch exported"
        );
        Ok(batch)
    }

    async fn export_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VectorRecord>> {
        let expr = format!(
            "{FIELD_CREATE_TIME} >= {} and {FIELD_CREATE_TIME} <= {}",
            start.timestamp_millis(),
            end.timestamp_millis()
        );
        let collection = &self.collection;
        let rows = self
            .manager
            .run(|client| async move {
                let rows = client.query_all(collection, &expr, &EXPORT_FIELDS).await?;
                decode_sorted(&rows)
            })
            .await?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }

    async fn close(&self) -> Result<()> {
        if self.owns_connection {
            self.manager.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "milvus_tests.rs"]
mod tests;
