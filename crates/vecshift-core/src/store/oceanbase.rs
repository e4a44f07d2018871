//! OceanBase adapter (MySQL protocol, native `VECTOR` column).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, QueryBuilder, Row};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    is_write_retryable, rank_results, similarity_from_negative_inner_product, VectorStore,
    SEARCH_RETRY_DELAY, SQL_INSERT_RETRY_DELAY,
};
use crate::config::PoolConfig;
use crate::connection::{ConnectionManager, Connector};
use crate::error::{Error, Result};
use crate::filter::CollectionFilter;
use crate::retry::{is_retryable_error, with_retry_when, RetryConfig};
use crate::types::{
    check_dimensions, parse_id, parse_ids, BackendKind, DeleteSelector, RecallRequest,
    RecallResult, TenantScope, TimedVectorRef,
};
use crate::vector_text::format_vector;

/// Opens `MySqlPool`s against an OceanBase tenant.
pub struct OceanBaseConnector {
    url: String,
    pool: PoolConfig,
}

impl OceanBaseConnector {
    /// Creates a connector for `url` with the given pool sizing.
    pub fn new(url: String, pool: PoolConfig) -> Self {
        Self { url, pool }
    }
}

#[async_trait]
impl Connector for OceanBaseConnector {
    type Handle = MySqlPool;

    fn name(&self) -> &'static str {
        "oceanbase"
    }

    async fn connect(&self) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(self.pool.max_connections)
            .min_connections(self.pool.min_connections)
            .acquire_timeout(self.pool.acquire_timeout())
            .idle_timeout(self.pool.idle_timeout())
            .connect(&self.url)
            .await?;
        Ok(pool)
    }

    async fn disconnect(&self, pool: MySqlPool) {
        pool.close().await;
    }
}

/// Table DDL with the inline HNSW vector index.
#[must_use]
pub fn create_table_sql(table: &str, dimension: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            vector VECTOR({dimension}) NOT NULL,
            team_id VARCHAR(50) NOT NULL,
            dataset_id VARCHAR(50) NOT NULL,
            collection_id VARCHAR(50) NOT NULL,
            createtime DATETIME DEFAULT CURRENT_TIMESTAMP,
            VECTOR INDEX vector_index(vector) WITH (distance=inner_product, type=hnsw, m=32, ef_construction=128)
        )"
    )
}

/// Secondary indexes; re-running them fails with a duplicate-key error that
/// [`OceanBaseStore::init`] tolerates.
#[must_use]
pub fn index_statements(table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE INDEX team_dataset_collection_index ON {table}(team_id, dataset_id, collection_id)"
        ),
        format!("CREATE INDEX create_time_index ON {table}(createtime)"),
    ]
}

/// Whether `error` only says the index exists already.
pub fn is_duplicate_index(error: &Error) -> bool {
    match error {
        Error::Database(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("duplicate key name") || msg.contains("already exists")
        }
        _ => false,
    }
}

/// Builds the approximate search statement for `filter`.
///
/// Bind order: query vector, team id, each dataset id, each collection id
/// (when filtered), limit.
pub fn recall_query<'a>(
    table: &str,
    request: &'a RecallRequest,
    filter: &'a CollectionFilter,
) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new("SELECT id, collection_id, negative_inner_product(vector, ");
    qb.push_bind(format_vector(&request.vector));
    qb.push(format!(") AS score FROM {table} WHERE team_id = "));
    qb.push_bind(request.team_id.as_str());
    qb.push(" AND dataset_id IN (");
    push_list(&mut qb, &request.dataset_ids);
    qb.push(")");
    match filter {
        CollectionFilter::Allow(ids) => {
            qb.push(" AND collection_id IN (");
            push_list(&mut qb, ids);
            qb.push(")");
        }
        CollectionFilter::Deny(ids) => {
            qb.push(" AND collection_id NOT IN (");
            push_list(&mut qb, ids);
            qb.push(")");
        }
        CollectionFilter::Unrestricted | CollectionFilter::Nothing => {}
    }
    qb.push(" ORDER BY score APPROXIMATE LIMIT ");
    qb.push_bind(u64::try_from(request.limit).unwrap_or(u64::MAX));
    qb
}

fn push_list<'a>(qb: &mut QueryBuilder<'a, MySql>, values: &'a [String]) {
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.as_str());
    }
}

/// Vector store backed by OceanBase.
pub struct OceanBaseStore {
    manager: Arc<ConnectionManager<OceanBaseConnector>>,
    table: String,
    dimension: usize,
    ef_search: u32,
}

impl OceanBaseStore {
    /// Creates an adapter sharing `manager`'s pool.
    pub fn new(
        manager: Arc<ConnectionManager<OceanBaseConnector>>,
        table: String,
        dimension: usize,
        ef_search: u32,
    ) -> Self {
        Self {
            manager,
            table,
            dimension,
            ef_search,
        }
    }

    async fn insert_once(&self, scope: &TenantScope, vectors: &[Vec<f32>]) -> Result<Vec<String>> {
        let table = self.table.clone();
        self.manager
            .run(|pool| async move {
                let mut qb: QueryBuilder<'_, MySql> = QueryBuilder::new(format!(
                    "INSERT INTO {table} (vector, team_id, dataset_id, collection_id) "
                ));
                qb.push_values(vectors, |mut row, vector| {
                    row.push_bind(format_vector(vector))
                        .push_bind(scope.team_id.clone())
                        .push_bind(scope.dataset_id.clone())
                        .push_bind(scope.collection_id.clone());
                });
                let result = qb.build().execute(&pool).await?;

                // A multi-row insert reports the id of its first row; the
                // rest follow consecutively.
                let first = result.last_insert_id();
                Ok((0..vectors.len() as u64)
                    .map(|offset| (first + offset).to_string())
                    .collect())
            })
            .await
    }

    async fn recall_once(
        &self,
        request: &RecallRequest,
        filter: &CollectionFilter,
    ) -> Result<Vec<RecallResult>> {
        let table = self.table.clone();
        let ef_search = self.ef_search;
        self.manager
            .run(|pool| async move {
                let mut conn = pool.acquire().await?;
                sqlx::query(&format!("SET ob_hnsw_ef_search = {ef_search}"))
                    .execute(&mut *conn)
                    .await?;
                let mut qb = recall_query(&table, request, filter);
                let rows = qb.build().fetch_all(&mut *conn).await?;
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

fn decode_recall_row(row: &MySqlRow) -> Result<RecallResult> {
    let id: i64 = row.try_get("id")?;
    let distance: f64 = row.try_get("score")?;
    Ok(RecallResult {
        id: id.to_string(),
        collection_id: row.try_get("collection_id")?,
        score: similarity_from_negative_inner_product(distance),
    })
}

#[async_trait]
impl VectorStore for OceanBaseStore {
    fn kind(&self) -> BackendKind {
        BackendKind::OceanBase
    }

    async fn init(&self) -> Result<()> {
        let create = create_table_sql(&self.table, self.dimension);
        let indexes = index_statements(&self.table);
        self.manager
            .run(|pool| async move {
                sqlx::query(&create).execute(&pool).await?;
                for statement in &indexes {
                    if let Err(e) = sqlx::query(statement).execute(&pool).await {
                        let e = Error::from(e);
                        if !is_duplicate_index(&e) {
                            return Err(e);
                        }
                        debug!("index already present: {}", statement);
                    }
                }
                Ok(())
            })
            .await?;
        info!(table = %self.table, dimension = self.dimension, "oceanbase schema ready");
        Ok(())
    }

    async fn insert(&self, scope: &TenantScope, vectors: &[Vec<f32>]) -> Result<Vec<String>> {
        check_dimensions(self.dimension, vectors)?;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let ids = with_retry_when(
            &RetryConfig::fixed(1, SQL_INSERT_RETRY_DELAY),
            "oceanbase insert",
            is_write_retryable,
            || self.insert_once(scope, vectors),
        )
        .await?;
        debug!(count = ids.len(), collection = %scope.collection_id, "oceanbase insert");
        Ok(ids)
    }

    async fn delete(&self, team_id: &str, selector: &DeleteSelector) -> Result<()> {
        if selector.is_noop() {
            return Ok(());
        }
        let ids = match selector {
            DeleteSelector::Id(id) => vec![parse_id(id)?],
            DeleteSelector::IdList(ids) => parse_ids(ids)?,
            DeleteSelector::Datasets { .. } => Vec::new(),
        };
        let table = self.table.clone();

        self.manager
            .run(|pool| async move {
                let mut qb: QueryBuilder<'_, MySql> =
                    QueryBuilder::new(format!("DELETE FROM {table} WHERE team_id = "));
                qb.push_bind(team_id);
                match selector {
                    DeleteSelector::Id(_) | DeleteSelector::IdList(_) => {
                        qb.push(" AND id IN (");
                        let mut separated = qb.separated(", ");
                        for id in &ids {
                            separated.push_bind(*id);
                        }
                        qb.push(")");
                    }
                    DeleteSelector::Datasets {
                        dataset_ids,
                        collection_ids,
                    } => {
                        qb.push(" AND dataset_id IN (");
                        push_list(&mut qb, dataset_ids);
                        qb.push(")");
                        if let Some(collection_ids) = collection_ids {
                            qb.push(" AND collection_id IN (");
                            push_list(&mut qb, collection_ids);
                            qb.push(")");
                        }
                    }
                }
                let result = qb.build().execute(&pool).await?;
                debug!(rows = result.rows_affected(), "oceanbase delete");
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

        let results = with_retry_when(
            &RetryConfig::fixed(request.retry, SEARCH_RETRY_DELAY),
            "oceanbase emb_recall",
            is_retryable_error,
            || self.recall_once(request, &filter),
        )
        .await?;
        Ok(rank_results(results, request.limit))
    }

    async fn count_by_team(&self, team_id: &str) -> Result<u64> {
        self.count_where("team_id = ?", &[team_id]).await
    }

    async fn count_by_dataset(&self, team_id: &str, dataset_id: &str) -> Result<u64> {
        self.count_where("team_id = ? AND dataset_id = ?", &[team_id, dataset_id])
            .await
    }

    async fn count_by_collection(
        &self,
        team_id: &str,
        dataset_id: &str,
        collection_id: &str,
    ) -> Result<u64> {
        self.count_where(
            "team_id = ? AND dataset_id = ? AND collection_id = ?",
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
            "SELECT id, team_id, dataset_id FROM {} WHERE createtime BETWEEN ? AND ?",
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
