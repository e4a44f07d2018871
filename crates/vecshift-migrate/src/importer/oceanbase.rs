//! OceanBase importer.

use async_trait::async_trait;
use sqlx::{MySql, QueryBuilder};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use vecshift_core::connection::ConnectionManager;
use vecshift_core::retry::{with_retry, RetryConfig};
use vecshift_core::store::oceanbase::{OceanBaseConnector, OceanBaseStore};
use vecshift_core::store::{VectorStore, SQL_INSERT_RETRY_DELAY};
use vecshift_core::types::{BackendKind, VectorRecord};
use vecshift_core::vector_text::format_vector;
use vecshift_core::Error as StoreError;

use super::{
    import_records, numeric_ids, retain_present, BatchWriter, ImportOutcome, Importer,
    ImporterSettings, KeyedRow,
};
use crate::error::Result;
use crate::exporter::oceanbase::count_query;
use crate::exporter::ScopeFilter;
use crate::id_map::IdPlanner;

/// Ids given to `count` rows by one auto-increment insert.
///
/// The server reports the first id of the statement; the rest follow
/// consecutively.
///
/// # Errors
///
/// Returns `DataCorruption` if the ids do not fit in `i64`.
pub fn assigned_ids(last_insert_id: u64, count: usize) -> vecshift_core::Result<Vec<i64>> {
    let out_of_range = || {
        StoreError::DataCorruption(format!(
            "oceanbase assigned ids from {last_insert_id} overflow i64 for {count} rows"
        ))
    };
    let first = i64::try_from(last_insert_id).map_err(|_| out_of_range())?;
    let span = i64::try_from(count).map_err(|_| out_of_range())?;
    if count > 0 {
        first.checked_add(span - 1).ok_or_else(out_of_range)?;
    }
    Ok((first..first + span).collect())
}

/// `INSERT IGNORE` for rows with explicit ids.
pub fn keyed_insert<'a>(table: &str, rows: &'a [KeyedRow<'a>]) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT IGNORE INTO {table} (id, vector, team_id, dataset_id, collection_id, createtime) "
    ));
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.id)
            .push_bind(format_vector(&row.record.vector))
            .push_bind(row.record.team_id.as_str())
            .push_bind(row.record.dataset_id.as_str())
            .push_bind(row.record.collection_id.as_str())
            .push_bind(row.record.create_time.naive_utc());
    });
    qb
}

/// `INSERT` letting `AUTO_INCREMENT` pick ids.
pub fn assigned_insert<'a>(table: &str, records: &'a [&'a VectorRecord]) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {table} (vector, team_id, dataset_id, collection_id, createtime) "
    ));
    qb.push_values(records, |mut b, record| {
        b.push_bind(format_vector(&record.vector))
            .push_bind(record.team_id.as_str())
            .push_bind(record.dataset_id.as_str())
            .push_bind(record.collection_id.as_str())
            .push_bind(record.create_time.naive_utc());
    });
    qb
}

/// `SELECT id ... WHERE id IN (...)`.
pub fn id_lookup<'a>(select: &str, table: &str, ids: &'a [i64]) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(format!("{select} FROM {table} WHERE id IN ("));
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    qb.push(")");
    qb
}

/// Writes records into an OceanBase table.
pub struct OceanBaseImporter {
    manager: Arc<ConnectionManager<OceanBaseConnector>>,
    table: String,
    dimension: usize,
    ef_search: u32,
    planner: IdPlanner,
    retry: RetryConfig,
}

impl OceanBaseImporter {
    /// Creates an importer owning `manager`.
    pub fn new(
        manager: Arc<ConnectionManager<OceanBaseConnector>>,
        settings: &ImporterSettings,
    ) -> Self {
        Self {
            manager,
            table: settings.table.clone(),
            dimension: settings.dimension,
            ef_search: settings.oceanbase.ef_search,
            planner: IdPlanner::new(settings.preserve_ids),
            retry: RetryConfig::fixed(1, SQL_INSERT_RETRY_DELAY),
        }
    }

    async fn write_keyed_once(&self, rows: &[KeyedRow<'_>]) -> vecshift_core::Result<()> {
        let table = &self.table;
        self.manager
            .run(|pool| async move {
                let mut qb = keyed_insert(table, rows);
                let result = qb.build().execute(&pool).await?;
                debug!(rows = rows.len(), written = result.rows_affected(), "oceanbase keyed insert");
                Ok(())
            })
            .await
    }

    async fn write_assigned_once(&self, records: &[&VectorRecord]) -> vecshift_core::Result<Vec<i64>> {
        let table = &self.table;
        self.manager
            .run(|pool| async move {
                let mut qb = assigned_insert(table, records);
                let result = qb.build().execute(&pool).await?;
                assigned_ids(result.last_insert_id(), records.len())
            })
            .await
    }
}

#[async_trait]
impl BatchWriter for OceanBaseImporter {
    async fn existing(&self, ids: &[i64]) -> vecshift_core::Result<HashSet<i64>> {
        let table = &self.table;
        self.manager
            .run(|pool| async move {
                let mut qb = id_lookup("SELECT id", table, ids);
                let rows: Vec<(i64,)> = qb.build_query_as().fetch_all(&pool).await?;
                Ok(rows.into_iter().map(|(id,)| id).collect())
            })
            .await
    }

    async fn write_keyed(&self, rows: &[KeyedRow<'_>]) -> vecshift_core::Result<()> {
        with_retry(&self.retry, "oceanbase import", || self.write_keyed_once(rows)).await
    }

    async fn write_assigned(&self, records: &[&VectorRecord]) -> vecshift_core::Result<Vec<i64>> {
        with_retry(&self.retry, "oceanbase import", || self.write_assigned_once(records)).await
    }
}

#[async_trait]
impl Importer for OceanBaseImporter {
    fn kind(&self) -> BackendKind {
        BackendKind::OceanBase
    }

    async fn init(&self) -> Result<()> {
        let store = OceanBaseStore::new(
            self.manager.clone(),
            self.table.clone(),
            self.dimension,
            self.ef_search,
        );
        store.init().await?;
        info!(table = %self.table, "oceanbase import target ready");
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
        let table = &self.table;
        let ids = &ids;
        let deleted = self
            .manager
            .run(|pool| async move {
                let mut qb = id_lookup("DELETE", table, ids);
                let result = qb.build().execute(&pool).await?;
                Ok(result.rows_affected())
            })
            .await?;
        Ok(deleted)
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
