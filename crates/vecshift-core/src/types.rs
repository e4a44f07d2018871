//! Shared data model for vector records, tenant scopes and search requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default number of retries for `emb_recall` on transient errors.
pub const DEFAULT_RECALL_RETRY: u32 = 2;

/// Largest id the importers will carry over verbatim (2^53 - 1).
///
/// Ids above this cannot be represented exactly by JSON consumers of the
/// platform, so they are regenerated during migration.
pub const MAX_SAFE_ID: i64 = 9_007_199_254_740_991;

/// The vector backend families supported by this crate.
///
/// Factories dispatch on this enum; there is exactly one adapter, exporter
/// and importer per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// PostgreSQL with the `pgvector` extension.
    #[serde(rename = "pg", alias = "pgvector", alias = "postgres")]
    Pg,
    /// OceanBase (MySQL protocol, native `VECTOR` column).
    #[serde(rename = "oceanbase", alias = "ob", alias = "seekdb")]
    OceanBase,
    /// Milvus / Zilliz vector-search service.
    #[serde(rename = "milvus", alias = "zilliz")]
    Milvus,
}

impl BackendKind {
    /// All supported kinds, in a stable order.
    pub const ALL: [Self; 3] = [Self::Pg, Self::OceanBase, Self::Milvus];

    /// Canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pg => "pg",
            Self::OceanBase => "oceanbase",
            Self::Milvus => "milvus",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pg" | "pgvector" | "postgres" => Ok(Self::Pg),
            "oceanbase" | "ob" | "seekdb" => Ok(Self::OceanBase),
            "milvus" | "zilliz" => Ok(Self::Milvus),
            other => Err(Error::Config(format!(
                "unknown backend type '{other}', expected one of: pg, oceanbase, milvus"
            ))),
        }
    }
}

/// A stored embedding together with its tenant coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Backend-assigned identifier (an integer rendered as a string).
    pub id: String,
    /// Embedding values.
    pub vector: Vec<f32>,
    /// Owning team.
    pub team_id: String,
    /// Owning dataset.
    pub dataset_id: String,
    /// Owning collection.
    pub collection_id: String,
    /// Creation timestamp.
    pub create_time: DateTime<Utc>,
}

impl VectorRecord {
    /// Parses the id as a backend integer key.
    pub fn numeric_id(&self) -> Result<i64> {
        parse_id(&self.id)
    }
}

/// Identity tuple supplied by the application's permission layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    /// Team id. Every query is constrained by it.
    pub team_id: String,
    /// Dataset id.
    pub dataset_id: String,
    /// Collection id.
    pub collection_id: String,
}

impl TenantScope {
    /// Creates a scope from its three components.
    pub fn new(
        team_id: impl Into<String>,
        dataset_id: impl Into<String>,
        collection_id: impl Into<String>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            dataset_id: dataset_id.into(),
            collection_id: collection_id.into(),
        }
    }
}

/// Which rows a delete applies to. Always AND-ed with the team id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSelector {
    /// A single record.
    Id(String),
    /// Everything in the given datasets, optionally narrowed to collections.
    Datasets {
        /// Dataset ids.
        dataset_ids: Vec<String>,
        /// Optional collection ids.
        collection_ids: Option<Vec<String>>,
    },
    /// An explicit list of records. An empty list is a no-op.
    IdList(Vec<String>),
}

impl DeleteSelector {
    /// True when the selector cannot match anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Id(_) => false,
            Self::Datasets {
                dataset_ids,
                collection_ids,
            } => dataset_ids.is_empty() || collection_ids.as_ref().is_some_and(Vec::is_empty),
            Self::IdList(ids) => ids.is_empty(),
        }
    }
}

/// Parameters of a nearest-neighbour search.
#[derive(Debug, Clone)]
pub struct RecallRequest {
    /// Team the search is confined to.
    pub team_id: String,
    /// Datasets the search is confined to.
    pub dataset_ids: Vec<String>,
    /// Query embedding.
    pub vector: Vec<f32>,
    /// Maximum number of hits.
    pub limit: usize,
    /// Collections that must never appear in the results.
    pub forbid_collection_ids: Vec<String>,
    /// When present, only these collections may appear (minus the forbidden ones).
    pub filter_collection_ids: Option<Vec<String>>,
    /// Retries on transient errors.
    pub retry: u32,
}

impl RecallRequest {
    /// Creates an unfiltered request with the default retry count.
    pub fn new(
        team_id: impl Into<String>,
        dataset_ids: Vec<String>,
        vector: Vec<f32>,
        limit: usize,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            dataset_ids,
            vector,
            limit,
            forbid_collection_ids: Vec::new(),
            filter_collection_ids: None,
            retry: DEFAULT_RECALL_RETRY,
        }
    }

    /// Sets the forbidden collections.
    #[must_use]
    pub fn forbid(mut self, collection_ids: Vec<String>) -> Self {
        self.forbid_collection_ids = collection_ids;
        self
    }

    /// Sets the allowed collections.
    #[must_use]
    pub fn only(mut self, collection_ids: Vec<String>) -> Self {
        self.filter_collection_ids = Some(collection_ids);
        self
    }

    /// Overrides the retry count.
    #[must_use]
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }
}

/// One search hit. Higher `score` means more similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallResult {
    /// Record id.
    pub id: String,
    /// Collection the record belongs to.
    pub collection_id: String,
    /// Inner-product similarity.
    pub score: f64,
}

/// Lightweight reference returned by time-window scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedVectorRef {
    /// Record id.
    pub id: String,
    /// Owning team.
    pub team_id: String,
    /// Owning dataset.
    pub dataset_id: String,
}

/// Parses a string id into a positive backend integer key.
pub fn parse_id(id: &str) -> Result<i64> {
    match id.trim().parse::<i64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidId(id.to_string())),
    }
}

/// Parses a list of ids, failing on the first invalid one.
pub fn parse_ids(ids: &[String]) -> Result<Vec<i64>> {
    ids.iter().map(|id| parse_id(id)).collect()
}

/// Checks every vector against the schema dimension.
pub fn check_dimensions(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    match vectors.iter().find(|v| v.len() != expected) {
        Some(v) => Err(Error::DimensionMismatch {
            expected,
            actual: v.len(),
        }),
        None => Ok(()),
    }
}
