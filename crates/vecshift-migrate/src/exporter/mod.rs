//! Cursor-paginated readers, one per backend.
//!
//! Every exporter pages strictly by ascending numeric id: a batch asks for
//! `limit + 1` rows after the cursor and trims the extra row to learn whether
//! another page exists.

pub mod milvus;
pub mod oceanbase;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use vecshift_core::connection::ConnectionManager;
use vecshift_core::retry::RetryConfig;
use vecshift_core::store::{milvus::MilvusConnector, oceanbase::OceanBaseConnector, pg::PgConnector};
use vecshift_core::types::{BackendKind, VectorRecord};
use vecshift_core::Backends;

use crate::config::SourceSettings;
use crate::error::Result;

/// Optional tenant narrowing for counts and exports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Only this team.
    pub team_id: Option<String>,
    /// Only this dataset.
    pub dataset_id: Option<String>,
}

impl ScopeFilter {
    /// Everything.
    pub fn all() -> Self {
        Self::default()
    }
}

/// One page request.
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    /// Exclusive lower bound on the id; `None` starts from the beginning.
    pub after_id: Option<i64>,
    /// Page size.
    pub limit: usize,
    /// Only this team.
    pub team_id: Option<String>,
    /// Only this dataset.
    pub dataset_id: Option<String>,
}

impl ExportRequest {
    /// The tenant part of the request.
    pub fn scope(&self) -> ScopeFilter {
        ScopeFilter {
            team_id: self.team_id.clone(),
            dataset_id: self.dataset_id.clone(),
        }
    }
}

/// One page of records.
#[derive(Debug, Clone, Default)]
pub struct ExportBatch {
    /// Records in ascending id order.
    pub records: Vec<VectorRecord>,
    /// Whether another page follows.
    pub has_more: bool,
    /// Id of the last record, the next cursor.
    pub last_id: Option<i64>,
}

impl ExportBatch {
    /// Builds a page from up to `limit + 1` rows sorted by id.
    pub fn from_rows(mut rows: Vec<(i64, VectorRecord)>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let last_id = rows.last().map(|(id, _)| *id);
        Self {
            records: rows.into_iter().map(|(_, record)| record).collect(),
            has_more,
            last_id,
        }
    }
}

/// Reads records out of a source backend.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Backend family.
    fn kind(&self) -> BackendKind;

    /// Number of records matching `filter`.
    async fn count(&self, filter: &ScopeFilter) -> Result<u64>;

    /// Next page after `request.after_id`.
    async fn export_batch(&self, request: &ExportRequest) -> Result<ExportBatch>;

    /// Every record created inside `[start, end]`, unpaginated.
    async fn export_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VectorRecord>>;

    /// Releases the connection.
    async fn close(&self) -> Result<()>;
}

/// Retry policy for batch reads.
#[must_use]
pub fn export_retry() -> RetryConfig {
    RetryConfig::default()
}

/// Creates the exporter for `kind`.
///
/// Without `source`, the exporter shares the connection manager `backends`
/// holds for that kind and leaves it open on close; with it, a dedicated
/// manager is built for that endpoint and closed with the exporter.
pub fn create_exporter(
    kind: BackendKind,
    source: Option<&SourceSettings>,
    backends: &Backends,
) -> Result<Box<dyn Exporter>> {
    let config = backends.config();
    let table = config.vector.table.clone();
    let delay = config.connection.reconnect_delay();
    let retry = export_retry();

    let exporter: Box<dyn Exporter> = match (kind, source) {
        (BackendKind::Pg, None) => Box::new(pg::PgExporter::new(backends.pg()?, table, retry)),
        (BackendKind::Pg, Some(source)) => {
            let connector = PgConnector::new(source.address.clone(), config.pg.pool.clone());
            let manager = Arc::new(ConnectionManager::new(connector, delay));
            Box::new(pg::PgExporter::new(manager, table, retry).owning())
        }
        (BackendKind::OceanBase, None) => Box::new(oceanbase::OceanBaseExporter::new(
            backends.oceanbase()?,
            table,
            retry,
        )),
        (BackendKind::OceanBase, Some(source)) => {
            let connector =
                OceanBaseConnector::new(source.address.clone(), config.oceanbase.pool.clone());
            let manager = Arc::new(ConnectionManager::new(connector, delay));
            Box::new(oceanbase::OceanBaseExporter::new(manager, table, retry).owning())
        }
        (BackendKind::Milvus, None) => {
            Box::new(milvus::MilvusExporter::new(backends.milvus()?, table, retry))
        }
        (BackendKind::Milvus, Some(source)) => {
            let connector = MilvusConnector::new(
                source.address.clone(),
                source.token.clone(),
                Duration::from_secs(config.milvus.timeout_secs),
            );
            let manager = Arc::new(ConnectionManager::new(connector, delay));
            Box::new(milvus::MilvusExporter::new(manager, table, retry).owning())
        }
    };
    Ok(exporter)
}
