//! Batch writers, one per backend.
//!
//! Every importer plans ids with [`IdPlanner`] and writes through the
//! [`BatchWriter`] seam, so the id rules are identical across targets:
//!
//! | Placement | Pg | OceanBase | Milvus |
//! |-----------|----|-----------|--------|
//! | keep / remap | `ON CONFLICT (id) DO NOTHING` + `setval` | `INSERT IGNORE` | `upsert` |
//! | target assigns | `RETURNING id` | `LAST_INSERT_ID()` + offset | client-side ids + `upsert` |

pub mod milvus;
pub mod oceanbase;
pub mod pg;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use vecshift_core::config::{OceanBaseConfig, PgConfig, StoreConfig};
use vecshift_core::connection::ConnectionManager;
use vecshift_core::store::{milvus::MilvusConnector, oceanbase::OceanBaseConnector, pg::PgConnector};
use vecshift_core::types::{BackendKind, VectorRecord};
use vecshift_core::Error as StoreError;

use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::exporter::ScopeFilter;
use crate::id_map::{IdPlanner, Placement};
use crate::state::MigrationError;

/// What one `import_batch` call achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportOutcome {
    /// Target ids written by this call.
    pub inserted_ids: Vec<String>,
    /// Target ids that were already present and left untouched.
    pub skipped_ids: Vec<String>,
    /// Source id to target id, for every record whose id changed.
    pub id_mappings: BTreeMap<String, String>,
    /// Records rejected individually.
    pub errors: Vec<MigrationError>,
}

impl ImportOutcome {
    /// Records now present on the target.
    #[must_use]
    pub fn migrated(&self) -> u64 {
        (self.inserted_ids.len() + self.skipped_ids.len()) as u64
    }
}

/// Target-side settings shared by every importer.
#[derive(Debug, Clone)]
pub struct ImporterSettings {
    /// Table or collection name.
    pub table: String,
    /// Fixed vector dimension.
    pub dimension: usize,
    /// Carry source ids over.
    pub preserve_ids: bool,
    /// pgvector pool and tuning.
    pub pg: PgConfig,
    /// OceanBase pool and tuning.
    pub oceanbase: OceanBaseConfig,
    /// Milvus request timeout.
    pub request_timeout: Duration,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl ImporterSettings {
    /// Settings derived from the store configuration.
    pub fn from_store(config: &StoreConfig, preserve_ids: bool) -> Self {
        Self {
            table: config.vector.table.clone(),
            dimension: config.vector.dimension,
            preserve_ids,
            pg: config.pg.clone(),
            oceanbase: config.oceanbase.clone(),
            request_timeout: Duration::from_secs(config.milvus.timeout_secs),
            reconnect_delay: config.connection.reconnect_delay(),
        }
    }
}

/// Writes records into a target backend.
#[async_trait]
pub trait Importer: Send + Sync {
    /// Backend family.
    fn kind(&self) -> BackendKind;

    /// Creates schema and indexes if absent. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Writes a batch. Per-record problems are reported in the outcome;
    /// an `Err` means nothing can be assumed about the batch.
    async fn import_batch(&self, records: &[VectorRecord]) -> Result<ImportOutcome>;

    /// Deletes target ids, returning how many were removed.
    async fn delete_batch(&self, ids: &[String]) -> Result<u64>;

    /// Number of records matching `filter`.
    async fn count(&self, filter: &ScopeFilter) -> Result<u64>;

    /// The subset of `ids` present on the target, in input order.
    async fn existing_ids(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Releases the connection.
    async fn close(&self) -> Result<()>;
}

/// A record written under a client-chosen id.
#[derive(Debug, Clone, Copy)]
pub struct KeyedRow<'a> {
    /// Target id.
    pub id: i64,
    /// Record payload.
    pub record: &'a VectorRecord,
}

/// Backend-specific half of an import.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Which of `ids` already exist on the target.
    async fn existing(&self, ids: &[i64]) -> vecshift_core::Result<HashSet<i64>>;

    /// Writes rows under their ids, leaving existing ids untouched.
    async fn write_keyed(&self, rows: &[KeyedRow<'_>]) -> vecshift_core::Result<()>;

    /// Writes records under target-chosen ids, returned in input order.
    async fn write_assigned(&self, records: &[&VectorRecord]) -> vecshift_core::Result<Vec<i64>>;
}

/// Runs one batch through `writer` with the shared id rules.
pub async fn import_records<W>(
    writer: &W,
    planner: &IdPlanner,
    dimension: usize,
    records: &[VectorRecord],
) -> Result<ImportOutcome>
where
    W: BatchWriter + ?Sized,
{
    let mut outcome = ImportOutcome::default();

    let mut accepted = Vec::with_capacity(records.len());
    for record in records {
        if record.vector.len() == dimension {
            accepted.push(record);
        } else {
            let error = Error::Store(StoreError::DimensionMismatch {
                expected: dimension,
                actual: record.vector.len(),
            });
            outcome
                .errors
                .push(MigrationError::from_error(&error, Some(record.id.clone())));
        }
    }
    if accepted.is_empty() {
        return Ok(outcome);
    }

    let lookup = planner.lookup_ids(&accepted);
    let existing = if lookup.is_empty() {
        HashSet::new()
    } else {
        writer.existing(&lookup).await?
    };
    let placements = planner.plan(&accepted, &existing);

    let mut keyed = Vec::new();
    let mut remapped = Vec::new();
    let mut assigned = Vec::new();
    for (record, placement) in accepted.iter().zip(&placements) {
        match *placement {
            Placement::Keep(id) => keyed.push(KeyedRow { id, record }),
            Placement::Remap(id) => {
                keyed.push(KeyedRow { id, record });
                remapped.push((record.id.clone(), id.to_string()));
            }
            Placement::Present(id) => outcome.skipped_ids.push(id.to_string()),
            Placement::Assign => assigned.push(*record),
        }
    }

    if !keyed.is_empty() {
        writer.write_keyed(&keyed).await?;
        outcome
            .inserted_ids
            .extend(keyed.iter().map(|row| row.id.to_string()));
        outcome.id_mappings.extend(remapped);
    }

    if !assigned.is_empty() {
        let ids = writer.write_assigned(&assigned).await?;
        if ids.len() != assigned.len() {
            return Err(StoreError::DataCorruption(format!(
                "target returned {} ids for {} rows",
                ids.len(),
                assigned.len()
            ))
            .into());
        }
        for (record, id) in assigned.iter().zip(ids) {
            outcome.inserted_ids.push(id.to_string());
            outcome.id_mappings.insert(record.id.clone(), id.to_string());
        }
    }

    Ok(outcome)
}

/// Parses the numeric ids in `ids`, dropping the rest.
pub(crate) fn numeric_ids(ids: &[String]) -> Vec<i64> {
    ids.iter().filter_map(|id| id.trim().parse::<i64>().ok()).collect()
}

/// Keeps the ids of `ids` found in `present`, in input order.
pub(crate) fn retain_present(ids: &[String], present: &HashSet<i64>) -> Vec<String> {
    ids.iter()
        .filter(|id| id.trim().parse::<i64>().is_ok_and(|n| present.contains(&n)))
        .cloned()
        .collect()
}

/// Creates the importer for `kind`, writing to `target`.
///
/// The importer owns a dedicated connection manager and closes it on
/// [`Importer::close`].
pub fn create_importer(
    kind: BackendKind,
    target: &TargetConfig,
    settings: &ImporterSettings,
) -> Result<Box<dyn Importer>> {
    let address = target.address.trim();
    if address.is_empty() {
        return Err(Error::Config("target address cannot be empty".to_string()));
    }

    let importer: Box<dyn Importer> = match kind {
        BackendKind::Pg => {
            let connector = PgConnector::new(address.to_string(), settings.pg.pool.clone());
            let manager = Arc::new(ConnectionManager::new(connector, settings.reconnect_delay));
            Box::new(pg::PgImporter::new(manager, settings))
        }
        BackendKind::OceanBase => {
            let connector =
                OceanBaseConnector::new(address.to_string(), settings.oceanbase.pool.clone());
            let manager = Arc::new(ConnectionManager::new(connector, settings.reconnect_delay));
            Box::new(oceanbase::OceanBaseImporter::new(manager, settings))
        }
        BackendKind::Milvus => {
            let connector = MilvusConnector::new(
                address.to_string(),
                target.token.clone(),
                settings.request_timeout,
            );
            let manager = Arc::new(ConnectionManager::new(connector, settings.reconnect_delay));
            Box::new(milvus::MilvusImporter::new(manager, settings))
        }
    };
    Ok(importer)
}

#[cfg(test)]
#[path = "import_tests.rs"]
mod tests;
