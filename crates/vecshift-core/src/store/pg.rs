//! PostgreSQL + pgvector adapter.
//!
//! Schema: one `BIGSERIAL` keyed table with a `vector(N)` column, an HNSW
//! index on `vector_ip_ops` and btree indexes on the tenant tuple and on
//! `createtime`. Searches run inside a transaction so the `SET LOCAL` tuning
//! knobs apply to that query only.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    is_write_retryable, rank_results, similarity_from_negative_inner_product, VectorStore,
    SEARCH_RETRY_DELAY, SQL_INSERT_RETRY_DELAY,
};
use crate::config::{PgConfig, PoolConfig};
use crate::connection::{ConnectionManager, Connector};
use crate::error::Result;
use crate::filter::CollectionFilter;
use crate::retry::{with_retry, with_retry_when, RetryConfig};
use crate::types::{
    check_dimensions, parse_id, parse_ids, BackendKind, DeleteSelector, RecallRequest,
    RecallResult, TenantScope, TimedVectorRef,
};
use crate::vector_text::format_vector;

/// Opens `PgPool`s for the connection manager.
pub struct PgConnector {
    url: String,
    pool: PoolConfig,
}

impl PgConnector {
    /// Creates a connector for `url` with the given pool sizing.
    pub fn new(url: String, pool: PoolConfig) -> Self {
        Self { url, pool }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Handle = PgPool;

    fn name(&self) -> &'static str {
        "pg"
    }

    async fn connect(&self) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.pool.max_connections)
            .min_connections(self.pool.min_connections)
            .acquire_timeout(self.pool.acquire_timeout())
            .idle_timeout(self.pool.idle_timeout())
            .connect(&self.url)
            .await?;
        Ok(pool)
    }

    async fn disconnect(&self, pool: PgPool) {
        pool.close().await;
    }
}

/// DDL executed by [`PgVectorStore::init`], in order.
///
/// Index creation uses `CONCURRENTLY` so an init against a live table does
/// not block writers.
#[must_use]
pub fn schema_statements(table: &str, dimension: usize) -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                vector VECTOR({dimension}) NOT NULL,
                team_id VARCHAR(50) NOT NULL,
                dataset_id VARCHAR(50) NOT NULL,
                collection_id VARCHAR(50) NOT NULL,
                createtime TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )"
        ),
        format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {table}_vector_index ON {table} \
             USING hnsw (vector vector_ip_ops) WITH (m = 32, ef_construction = 128)"
        ),
        format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {table}_team_dataset_collection_index \
             ON {table} USING btree (team_id, dataset_id, collection_id)"
        ),
        format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {table}_create_time_index \
             ON {table} USING btree (createtime)"
        ),
    ]
}

/// Builds the search statement.
///
/// Binds: `$1` query vector text, `$2` team id, `$3` dataset ids, then the
/// collection ids (`$4`) when the filter has any, then the limit.
#[must_use]
pub fn recall_sql(table: &str, filter: &CollectionFilter) -> String {
    let (collection_clause, limit_param) = match filter {
        CollectionFilter::Allow(_) => (" AND collection_id = ANY($4)", 5),
        CollectionFilter::Deny(_) => (" AND NOT (collection_id = ANY($4))", 5),
        CollectionFilter::Unrestricted | CollectionFilter::Nothing => ("", 4),
    };
    format!(
        "WITH relaxed_results AS MATERIALIZED (
            SELECT id, collection_id, vector <#> $1::vector AS score
            FROM {table}
            WHERE team_id = $2 AND dataset_id = ANY($3){collection_clause}
            ORDER BY score
            LIMIT ${limit_param}
        ) SELECT id, collection_id, score FROM relaxed_results ORDER BY score"
    )
}

/// `SET LOCAL` statements applied to every search transaction.
#[must_use]
pub fn search_tuning_statements(config: &PgConfig) -> [String; 3] {
    [
        format!("SET LOCAL hnsw.ef_search = {}", config.ef_search),
        format!("SET LOCAL hnsw.max_scan_tuples = {}", config.max_scan_tuples),
        "SET LOCAL hnsw.iterative_scan = relaxed_order".to_string(),
    ]
}

/// Vector store backed by PostgreSQL + pgvector.
pub struct PgVectorStore {
    manager: Arc<ConnectionManager<PgConnector>>,
    table: String,
    dimension: usize,
    config: PgConfig,
}

impl PgVectorStore {
    /// Creates an adapter sharing `manager`'s pool.
    pub fn new(
        manager: Arc<ConnectionManager<PgConnector>>,
        table: String,
        dimension: usize,
        config: PgConfig,
    ) -> Self {
        Self {
            manager,
            table,
            dimension,
            config,
        }
    }

    /// Table the adapter reads and writes.
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn insert_once(&self, scope: &TenantScope, vectors: &[Vec<f32>]) -> Result<Vec<String>> {
        let table = self.table.clone();
        self.manager
            .run(|pool| async move {
                let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                    "INSERT INTO {table} (vector, team_id, dataset_id, collection_id) "
                ));
                qb.push_values(vectors, |mut row, vector| {
                    row.push_bind(format_vector(vector))
                        .push_unseparated("::vector")
                        .push_bind(scope.team_id.clone())
                        .push_bind(scope.dataset_id.clone())
                        .push_bind(scope.collection_id.clone());
                });
                qb.push(" RETURNING id");

                let rows: Vec<(i64,)> = qb.build_query_as().fetch_all(&pool).await?;
                Ok(rows.into_iter().map(|(id,)| id.to_string()).collect())
            })
            .await
    }

    async fn recall_once(
        &self,
        request: &RecallRequest,
        filter: &CollectionFilter,
    ) -> Result<Vec<RecallResult>> {
        let sql = recall_sql(&self.table, filter);
        let tuning = search_tuning_statements(&self.config);
        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);

        self.manager
            .run(|pool| async move {
                let mut tx = pool.begin().await?;
                for statement in &tuning {
                    sqlx::query(statement).execute(&mut *tx).await?;
                }

                let mut query = sqlx::query(&sql)
                    .bind(format_vector(&request.vector))
                    .bind(&request.team_id)
                    .bind(&request.dataset_ids);
                match filter {
                    CollectionFilter::Allow(ids) | CollectionFilter::Deny(ids) => {
                        query = query.bind(ids);
                    }
                    CollectionFilter::Unrestricted | CollectionFilter::Nothing => {}
                }
                let rows = query.bind(limit).fetch_all(&mut *tx).await?;
                tx.commit().await?;

                rows.iter().map(decode_recall_row).collect()
            })
            .await
    }

    async fn count_where(&self, clause: &str, binds: &[&str]) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {clause}", self.table);
        self.manager
            .run(|pool| async move {
                let mut query = sqlx::query_scalar::<_, i64>(&sql);
                for value in binds {
                    query = query.bind(*value);
                }
                let count = query.fetch_one(&pool).await?;
                Ok(u64::try_from(count).unwrap_or_default())
            })
            .await
    }
}

fn decode_recall_row(row: &PgRow) -> Result<RecallResult> {
    let id: i64 = row.try_get("id")?;
    let distance: f64 = row.try_get("score")?;
    Ok(RecallResult {
        id: id.to_string(),
        collection_id: row.try_get("collection_id")?,
        score: similarity_from_negative_inner_product(distance),
    })
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Pg
    }

    async fn init(&self) -> Result<()> {
        let statements = schema_statements(&self.table, self.dimension);
        self.manager
            .run(|pool| async move {
                for statement in &statements {
                    sqlx::query(statement).execute(&pool).await?;
                }
                Ok(())
            })
            .await?;
        info!(table = %self.table, dimension = self.dimension, "pgvector schema ready");
        Ok(())
    }

    async fn insert(&self, scope: &TenantScope, vectors: &[Vec<f32>]) -> Result<Vec<String>> {
        check_dimensions(self.dimension, vectors)?;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let ids = with_retry_when(
            &RetryConfig::fixed(1, SQL_INSERT_RETRY_DELAY),
            "pg insert",
            is_write_retryable,
            || self.insert_once(scope, vectors),
        )
        .await?;
        debug!(count = ids.len(), collection = %scope.collection_id, "pg insert");
        Ok(ids)
    }

    async fn delete(&self, team_id: &str, selector: &DeleteSelector) -> Result<()> {
        if selector.is_noop() {
            return Ok(());
        }
        let table = self.table.clone();
        let team_id = team_id.to_string();

        // Validate ids before touching the pool.
        let ids = match selector {
            DeleteSelector::Id(id) => vec![parse_id(id)?],
            DeleteSelector::IdList(ids) => parse_ids(ids)?,
            DeleteSelector::Datasets { .. } => Vec::new(),
        };

        self.manager
            .run(|pool| async move {
                let result = match selector {
                    DeleteSelector::Id(_) | DeleteSelector::IdList(_) => {
                        sqlx::query(&format!(
                            "DELETE FROM {table} WHERE team_id = $1 AND id = ANY($2)"
                        ))
                        .bind(&team_id)
                        .bind(&ids)
                        .execute(&pool)
                        .await?
                    }
                    DeleteSelector::Datasets {
                        dataset_ids,
                        collection_ids: None,
                    } => {
                        sqlx::query(&format!(
                            "DELETE FROM {table} WHERE team_id = $1 AND dataset_id = ANY($2)"
                        ))
                        .bind(&team_id)
                        .bind(dataset_ids)
                        .execute(&pool)
                        .await?
                    }
                    DeleteSelector::Datasets {
                        dataset_ids,
                        collection_ids: Some(collection_ids),
                    } => {
                        sqlx::query(&format!(
                            "DELETE FROM {table} WHERE team_id = $1 AND dataset_id = ANY($2) \
                             AND collection_id = ANY($3)"
                        ))
                        .bind(&team_id)
                        .bind(dataset_ids)
                        .bind(collection_ids)
                        .execute(&pool)
                        .await?
                    }
                };
                debug!(rows = result.rows_affected(), "pg delete");
                Ok(())
            })
            .await
    }

    async fn emb_recall(&self, request: &RecallRequest) -> Result<Vec<RecallResult>> {
        let filter = CollectionFilter::resolve(
            &request.forbid_collection_ids,
            request.filter_collection_ids.as_deref(),
        );
        if filter.matches_nothing() || request.dataset_ids.is_empty() || request.limit == 0 {
            return Ok(Vec::new());
        }
        check_dimensions(self.dimension, std::slice::from_ref(&request.vector))?;

        let results = with_retry(
            &RetryConfig::fixed(request.retry, SEARCH_RETRY_DELAY),
            "pg emb_recall",
            || self.recall_once(request, &filter),
        )
        .await?;
        Ok(rank_results(results, request.limit))
    }

    async fn count_by_team(&self, team_id: &str) -> Result<u64> {
        self.count_where("team_id = $1", &[team_id]).await
    }

    async fn count_by_dataset(&self, team_id: &str, dataset_id: &str) -> Result<u64> {
        self.count_where("team_id = $1 AND dataset_id = $2", &[team_id, dataset_id])
            .await
    }

    async fn count_by_collection(
        &self,
        team_id: &str,
        dataset_id: &str,
        collection_id: &str,
    ) -> Result<u64> {
        self.count_where(
            "team_id = $1 AND dataset_id = $2 AND collection_id = $3",
            &[team_id, dataset_id, collection_id],
        )
        .await
    }

    async fn data_by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimedVectorRef>> {
        let sql = format!(
            "SELECT id, team_id, dataset_id FROM {} WHERE createtime BETWEEN $1 AND $2",
            self.table
        );
        self.manager
            .run(|pool| async move {
                let rows: Vec<(i64, String, String)> = sqlx::query_as(&sql)
                    .bind(start.naive_utc())
                    .bind(end.naive_utc())
                    .fetch_all(&pool)
                    .await?;
                Ok(rows
                    .into_iter()
                    .map(|(id, team_id, dataset_id)| TimedVectorRef {
                        id: id.to_string(),
                        team_id,
                        dataset_id,
                    })
                    .collect())
            })
            .await
    }
}

/// Converts a `TIMESTAMP` column value (stored in UTC) back to `DateTime<Utc>`.
#[must_use]
pub fn timestamp_to_utc(value: NaiveDateTime) -> DateTime<Utc> {
    value.and_utc()
}
