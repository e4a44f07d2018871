//! pgvector importer.

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use vecshift_core::config::PgConfig;
use vecshift_core::connection::ConnectionManager;
use vecshift_core::retry::{with_retry, RetryConfig};
use vecshift_core::store::pg::{PgConnector, PgVectorStore};
use vecshift_core::store::{VectorStore, SQL_INSERT_RETRY_DELAY};
use vecshift_core::types::{BackendKind, VectorRecord};
use vecshift_core::vector_text::format_vector;

use super::{
    import_records, numeric_ids, retain_present, BatchWriter, ImportOutcome, Importer,
    ImporterSettings, KeyedRow,
};
use crate::error::Result;
use crate::exporter::pg::count_query;
use crate::exporter::ScopeFilter;
use crate::id_map::IdPlanner;

/// `INSERT` for rows with explicit ids; existing ids are skipped.
pub fn keyed_insert<'a>(table: &str, rows: &'a [KeyedRow<'a>]) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {table} (id, vector, team_id, dataset_id, collection_id, createtime) "
    ));
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.id)
            .push_bind(format_vector(&row.record.vector))
            .push_unseparated("::vector")
            .push_bind(row.record.team_id.as_str())
            .push_bind(row.record.dataset_id.as_str())
            .push_bind(row.record.collection_id.as_str())
            .push_bind(row.record.create_time.naive_utc());
    });
    qb.push(" ON CONFLICT (id) DO NOTHING");
    qb
}

/// `INSERT` letting the serial column pick ids.
pub fn assigned_insert<'a>(table: &str, records: &'a [&'a VectorRecord]) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {table} (vector, team_id, dataset_id, collection_id, createtime) "
    ));
    qb.push_values(records, |mut b, record| {
        b.push_bind(format_vector(&record.vector))
            .push_unseparated("::vector")
            .push_bind(record.team_id.as_str())
            .push_bind(record.dataset_id.as_str())
            .push_bind(record.collection_id.as_str())
            .push_bind(record.create_time.naive_utc());
    });
    qb.push(" RETURNING id");
    qb
}

/// Moves the serial sequence past the largest id so later inserts by the
/// application do not collide with migrated ids.
pub fn sequence_sync_sql(table: &str) -> String {
    format!(
        "SELECT setval(pg_get_serial_sequence('{table}', 'id'), \
         (SELECT COALESCE(MAX(id), 1) FROM {table}))"
    )
}

/// Writes records into a pgvector table.
pub struct PgImporter {
    manager: Arc<ConnectionManager<PgConnector>>,
    table: String,
    dimension: usize,
    config: PgConfig,
    planner: IdPlanner,
    retry: RetryConfig,
}

impl PgImporter {
    /// Creates an importer owning `manager`.
    pub fn new(manager: Arc<ConnectionManager<PgConnector>>, settings: &ImporterSettings) -> Self {
        Self {
            manager,
            table: settings.table.clone(),
            dimension: settings.dimension,
            config: settings.pg.clone(),
            planner: IdPlanner::new(settings.preserve_ids),
            retry: RetryConfig::fixed(1, SQL_INSERT_RETRY_DELAY),
        }
    }

    async fn write_keyed_once(&self, rows: &[KeyedRow<'_>]) -> vecshift_core::Result<()> {
        let table = &self.table;
        self.manager
            .run(|pool| async move {
                let mut tx = pool.begin().await?;
                let mut qb = keyed_insert(table, rows);
                let result = qb.build().execute(&mut *tx).await?;
                sqlx::query(&sequence_sync_sql(table)).execute(&mut *tx).await?;
                tx.commit().await?;
                debug!(rows = rows.len(), written = result.rows_affected(), "pg keyed insert");
                Ok(())
            })
            .await
    }

    async fn write_assigned_once(&self, records: &[&VectorRecord]) -> vecshift_core::Result<Vec<i64>> {
        let table = &self.table;
        self.manager
            .run(|pool| async move {
                let mut qb = assigned_insert(table, records);
                let rows: Vec<(i64,)> = qb.build_query_as().fetch_all(&pool).await?;
                Ok(rows.into_iter().map(|(id,)| id).collect())
            })
            .await
    }
}

#[async_trait]
impl BatchWriter for PgImporter {
    async fn existing(&self, ids: &[i64]) -> vecshift_core::Result<HashSet<i64>> {
        let sql = format!("SELECT id FROM {} WHERE id = ANY($1)", self.table);
        self.manager
            .run(|pool| async move {
                let rows: Vec<(i64,)> = sqlx::query_as(&sql).bind(ids).fetch_all(&pool).await?;
                Ok(rows.into_iter().map(|(id,)| id).collect())
            })
            .await
    }

    async fn write_keyed(&self, rows: &[KeyedRow<'_>]) -> vecshift_core::Result<()> {
        with_retry(&self.retry, "pg import", || self.write_keyed_once(rows)).await
    }

    async fn write_assigned(&self, records: &[&VectorRecord]) -> vecshift_core::Result<Vec<i64>> {
        with_retry(&self.retry, "pg import", || self.write_assigned_once(records)).await
    }
}

#[async_trait]
impl Importer for PgImporter {
    fn kind(&self) -> BackendKind {
        BackendKind::Pg
    }

    async fn init(&self) -> Result<()> {
        let store = PgVectorStore::new(
            self.manager.clone(),
            self.table.clone(),
            self.dimension,
            self.config.clone(),
        );
        store.init().await?;
        info!(table = %self.table, "pg import target ready");
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
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", self.table);
        let deleted = self
            .manager
            .run(|pool| async move {
                let result = sqlx::query(&sql).bind(&ids).execute(&pool).await?;
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
