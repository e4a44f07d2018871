//! Milvus importer.
//!
//! Writes go through `upsert` into a collection created without auto-id, so
//! re-importing a batch replaces rows instead of duplicating them.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use vecshift_core::connection::ConnectionManager;
use vecshift_core::ids::IdGenerator;
use vecshift_core::retry::{with_retry, RetryConfig};
use vecshift_core::store::milvus::{
    entity_row, id_field, MilvusConnector, FIELD_ID, INSERT_RETRY_DELAY, MAX_QUERY_WINDOW,
};
use vecshift_core::types::{BackendKind, TenantScope, VectorRecord};

use super::{
    import_records, numeric_ids, retain_present, BatchWriter, ImportOutcome, Importer,
    ImporterSettings, KeyedRow,
};
use crate::error::{Error, Result};
use crate::exporter::milvus::scope_filter;
use crate::exporter::ScopeFilter;
use crate::id_map::IdPlanner;

/// Upsert payload row for `record` under `id`.
#[must_use]
pub fn record_row(id: i64, record: &VectorRecord) -> Value {
    let scope = TenantScope::new(
        record.team_id.clone(),
        record.dataset_id.clone(),
        record.collection_id.clone(),
    );
    entity_row(Some(id), &record.vector, &scope, record.create_time)
}

/// `id in [...]` expression.
#[must_use]
pub fn id_list_filter(ids: &[i64]) -> String {
    let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
    format!("{FIELD_ID} in [{}]", ids.join(", "))
}

/// Writes records into a Milvus collection.
pub struct MilvusImporter {
    manager: Arc<ConnectionManager<MilvusConnector>>,
    collection: String,
    dimension: usize,
    planner: IdPlanner,
    ids: IdGenerator,
    retry: RetryConfig,
}

impl MilvusImporter {
    /// Creates an importer owning `manager`.
    pub fn new(manager: Arc<ConnectionManager<MilvusConnector>>, settings: &ImporterSettings) -> Self {
        Self {
            manager,
            collection: settings.table.clone(),
            dimension: settings.dimension,
            planner: IdPlanner::new(settings.preserve_ids),
            ids: IdGenerator::new(),
            retry: RetryConfig::fixed(2, INSERT_RETRY_DELAY),
        }
    }

    async fn upsert(&self, rows: Vec<Value>) -> vecshift_core::Result<()> {
        let collection = &self.collection;
        with_retry(&self.retry, "milvus import", || {
            let rows = rows.clone();
            self.manager
                .run(|client| async move { client.upsert(collection, rows).await })
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchWriter for MilvusImporter {
    async fn existing(&self, ids: &[i64]) -> vecshift_core::Result<HashSet<i64>> {
        let collection = &self.collection;
        let mut present = HashSet::with_capacity(ids.len());
        // One lookup per query window; larger limits are rejected by the server.
        for chunk in ids.chunks(MAX_QUERY_WINDOW) {
            let filter = id_list_filter(chunk);
            let limit = chunk.len();
            let rows = self
                .manager
                .run(|client| async move {
                    client
                        .query(collection, &filter, &[FIELD_ID], Some(limit))
                        .await
                })
                .await?;
            for row in &rows {
                present.insert(id_field(row)?);
            }
        }
        Ok(present)
    }

    async fn write_keyed(&self, rows: &[KeyedRow<'_>]) -> vecshift_core::Result<()> {
        let payload = rows.iter().map(|row| record_row(row.id, row.record)).collect();
        self.upsert(payload).await
    }

    async fn write_assigned(&self, records: &[&VectorRecord]) -> vecshift_core::Result<Vec<i64>> {
        let ids = self.ids.next_ids(records.len());
        let payload = records
            .iter()
            .zip(&ids)
            .map(|(record, id)| record_row(*id, record))
            .collect();
        self.upsert(payload).await?;
        Ok(ids)
    }
}

#[async_trait]
impl Importer for MilvusImporter {
    fn kind(&self) -> BackendKind {
        BackendKind::Milvus
    }

    async fn init(&self) -> Result<()> {
        let collection = &self.collection;
        let dimension = self.dimension;
        let auto_id = self
            .manager
            .run(|client| async move { client.ensure_collection(collection, dimension, false).await })
            .await?;
        if auto_id {
            return Err(Error::Config(format!(
                "milvus collection '{collection}' assigns its own ids; \
                 import into a collection created without auto-id"
            )));
        }
        info!(collection = %collection, "milvus import target ready");
        Ok(())
    }

    async fn import_batch(&self, records: &[VectorRecord]) -> Result<ImportOutcome> {
        import_records(self, &self.planner, self.dimension, records).await
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<u64> {
        let ids = numeric_ids(ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let filter = id_list_filter(&ids);
        let collection = &self.collection;
        self.manager
            .run(|client| async move { client.delete(collection, &filter).await })
            .await?;
        // Milvus does not report how many entities a delete matched.
        Ok(ids.len() as u64)
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

    async fn existing_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let numeric = numeric_ids(ids);
        if numeric.is_empty() {
            return Ok(Vec::new());
        }
        let present = self.existing(&numeric).await?;
        Ok(retain_present(ids, &present))
    }

    async fn close(&self) -> Result<()> {
        self.manager.close().await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "milvus_tests.rs"]
mod tests;
