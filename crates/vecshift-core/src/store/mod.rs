//! Backend adapters.
//!
//! [`VectorStore`] is the single CRUD + search contract the application codes
//! against. There is one implementation per [`BackendKind`]:
//!
//! | Kind | Adapter | Handle |
//! |------|---------|--------|
//! | `pg` | [`pg::PgVectorStore`] | `sqlx::PgPool` |
//! | `oceanbase` | [`oceanbase::OceanBaseStore`] | `sqlx::MySqlPool` |
//! | `milvus` | [`milvus::MilvusStore`] | [`milvus::MilvusClient`] |
//!
//! [`Backends`] is the composition root: it owns one [`ConnectionManager`]
//! per configured backend and hands out adapters that share them.

pub mod milvus;
#[cfg(test)]
mod milvus_tests;
pub mod oceanbase;
pub mod pg;
#[cfg(test)]
mod pg_tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::types::{
    BackendKind, DeleteSelector, RecallRequest, RecallResult, TenantScope, TimedVectorRef,
};

/// Uniform vector-store contract.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Which backend family this adapter talks to.
    fn kind(&self) -> BackendKind;

    /// Creates schema, table/collection and indexes if absent. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Inserts vectors sharing one tenant tuple and returns their new ids,
    /// in input order.
    async fn insert(&self, scope: &TenantScope, vectors: &[Vec<f32>]) -> Result<Vec<String>>;

    /// Deletes the rows matched by `selector` inside `team_id`.
    async fn delete(&self, team_id: &str, selector: &DeleteSelector) -> Result<()>;

    /// Approximate nearest-neighbour search, best match first.
    async fn emb_recall(&self, request: &RecallRequest) -> Result<Vec<RecallResult>>;

    /// Number of vectors owned by a team.
    async fn count_by_team(&self, team_id: &str) -> Result<u64>;

    /// Number of vectors in one dataset.
    async fn count_by_dataset(&self, team_id: &str, dataset_id: &str) -> Result<u64>;

    /// Number of vectors in one collection.
    async fn count_by_collection(
        &self,
        team_id: &str,
        dataset_id: &str,
        collection_id: &str,
    ) -> Result<u64>;

    /// Records created inside `[start, end]`.
    async fn data_by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimedVectorRef>>;
}

/// Delay between SQL insert attempts.
pub const SQL_INSERT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Delay between search attempts on any backend.
pub const SEARCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Converts a negative inner product (pgvector `<#>`, OceanBase
/// `negative_inner_product`) into a similarity score.
#[must_use]
pub fn similarity_from_negative_inner_product(distance: f64) -> f64 {
    -distance
}

/// Write failures caused by the payload itself are not worth a second try.
pub(crate) fn is_write_retryable(error: &Error) -> bool {
    !matches!(
        error,
        Error::DataCorruption(_)
            | Error::DimensionMismatch { .. }
            | Error::InvalidId(_)
            | Error::Config(_)
            | Error::Authentication(_)
            | Error::Closed(_)
    )
}

/// Sorts hits best-first and truncates to `limit`.
pub fn rank_results(mut results: Vec<RecallResult>, limit: usize) -> Vec<RecallResult> {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(limit);
    results
}

/// Owns the connection managers of every configured backend.
pub struct Backends {
    config: StoreConfig,
    pg: Option<Arc<ConnectionManager<pg::PgConnector>>>,
    oceanbase: Option<Arc<ConnectionManager<oceanbase::OceanBaseConnector>>>,
    milvus: Option<Arc<ConnectionManager<milvus::MilvusConnector>>>,
}

impl Backends {
    /// Builds managers for every backend with an endpoint. Nothing connects yet.
    pub fn new(config: StoreConfig) -> Self {
        let delay = config.connection.reconnect_delay();

        let pg = config.pg.url.as_ref().map(|url| {
            Arc::new(ConnectionManager::new(
                pg::PgConnector::new(url.clone(), config.pg.pool.clone()),
                delay,
            ))
        });
        let oceanbase = config.oceanbase.url.as_ref().map(|url| {
            Arc::new(ConnectionManager::new(
                oceanbase::OceanBaseConnector::new(url.clone(), config.oceanbase.pool.clone()),
                delay,
            ))
        });
        let milvus = config.milvus.address.as_ref().map(|address| {
            Arc::new(ConnectionManager::new(
                milvus::MilvusConnector::new(
                    address.clone(),
                    config.milvus.token.clone(),
                    Duration::from_secs(config.milvus.timeout_secs),
                ),
                delay,
            ))
        });

        Self {
            config,
            pg,
            oceanbase,
            milvus,
        }
    }

    /// The configuration these backends were built from.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Shared pgvector manager.
    pub fn pg(&self) -> Result<Arc<ConnectionManager<pg::PgConnector>>> {
        self.pg.clone().ok_or_else(|| missing(BackendKind::Pg))
    }

    /// Shared OceanBase manager.
    pub fn oceanbase(&self) -> Result<Arc<ConnectionManager<oceanbase::OceanBaseConnector>>> {
        self.oceanbase
            .clone()
            .ok_or_else(|| missing(BackendKind::OceanBase))
    }

    /// Shared Milvus manager.
    pub fn milvus(&self) -> Result<Arc<ConnectionManager<milvus::MilvusConnector>>> {
        self.milvus.clone().ok_or_else(|| missing(BackendKind::Milvus))
    }

    /// Returns the adapter for `kind`.
    pub fn store(&self, kind: BackendKind) -> Result<Box<dyn VectorStore>> {
        let vector = &self.config.vector;
        match kind {
            BackendKind::Pg => Ok(Box::new(pg::PgVectorStore::new(
                self.pg()?,
                vector.table.clone(),
                vector.dimension,
                self.config.pg.clone(),
            ))),
            BackendKind::OceanBase => Ok(Box::new(oceanbase::OceanBaseStore::new(
                self.oceanbase()?,
                vector.table.clone(),
                vector.dimension,
                self.config.oceanbase.ef_search,
            ))),
            BackendKind::Milvus => Ok(Box::new(milvus::MilvusStore::new(
                self.milvus()?,
                vector.table.clone(),
                vector.dimension,
                self.config.milvus.ef,
            ))),
        }
    }

    /// Adapter for the configured default backend.
    pub fn default_store(&self) -> Result<Box<dyn VectorStore>> {
        let kind = self
            .config
            .backend
            .ok_or_else(|| Error::Config("no default backend configured".into()))?;
        self.store(kind)
    }

    /// Closes every manager.
    pub async fn close(&self) {
        if let Some(m) = &self.pg {
            m.close().await;
        }
        if let Some(m) = &self.oceanbase {
            m.close().await;
        }
        if let Some(m) = &self.milvus {
            m.close().await;
        }
    }
}

fn missing(kind: BackendKind) -> Error {
    Error::Config(format!("backend '{kind}' has no endpoint configured"))
}
