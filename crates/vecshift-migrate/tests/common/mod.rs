//! In-memory source and target shared by the migration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vecshift_core::{BackendKind, VectorRecord};
use vecshift_migrate::id_map::IdPlanner;
use vecshift_migrate::importer::{import_records, BatchWriter, KeyedRow};
use vecshift_migrate::{
    BackendFactory, ExportBatch, ExportRequest, Exporter, ImportOutcome, Importer,
    MigrationConfig, Result, ScopeFilter, TargetConfig,
};

pub const DIMENSION: usize = 3;

/// First id the memory target hands out for records it numbers itself.
pub const FIRST_SERIAL: i64 = 1_000_000;

pub fn record(id: i64) -> VectorRecord {
    VectorRecord {
        id: id.to_string(),
        vector: vec![0.1, 0.2, 0.3],
        team_id: "team-a".into(),
        dataset_id: "ds-1".into(),
        collection_id: "col-1".into(),
        create_time: Utc::now(),
    }
}

pub fn records(ids: impl IntoIterator<Item = i64>) -> Vec<VectorRecord> {
    ids.into_iter().map(record).collect()
}

pub fn config(batch_size: usize) -> MigrationConfig {
    let mut config = MigrationConfig::offline(
        BackendKind::Pg,
        BackendKind::Milvus,
        TargetConfig::new("http://target:19530"),
    );
    config.options.batch_size = batch_size;
    config
}

fn in_scope(record: &VectorRecord, filter: &ScopeFilter) -> bool {
    filter.team_id.as_ref().map_or(true, |t| *t == record.team_id)
        && filter.dataset_id.as_ref().map_or(true, |d| *d == record.dataset_id)
}

// -------------------------------------------------------------------------
// Source
// -------------------------------------------------------------------------

struct SourceInner {
    records: Vec<VectorRecord>,
    requests: Mutex<Vec<Option<i64>>>,
    fail_on_request: Option<usize>,
}

/// Pages through a fixed record list by ascending numeric id.
#[derive(Clone)]
pub struct FakeExporter {
    inner: Arc<SourceInner>,
}

impl FakeExporter {
    pub fn new(records: Vec<VectorRecord>) -> Self {
        Self::build(records, None)
    }

    /// Fails the `n`-th export request (1-based).
    pub fn failing_on(records: Vec<VectorRecord>, n: usize) -> Self {
        Self::build(records, Some(n))
    }

    fn build(mut records: Vec<VectorRecord>, fail_on_request: Option<usize>) -> Self {
        records.sort_by_key(|r| r.numeric_id().unwrap_or_default());
        Self {
            inner: Arc::new(SourceInner {
                records,
                requests: Mutex::new(Vec::new()),
                fail_on_request,
            }),
        }
    }

    /// `after_id` of every export request so far.
    pub fn requests(&self) -> Vec<Option<i64>> {
        self.inner.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exporter for FakeExporter {
    fn kind(&self) -> BackendKind {
        BackendKind::Pg
    }

    async fn count(&self, filter: &ScopeFilter) -> Result<u64> {
        Ok(self
            .inner
            .records
            .iter()
            .filter(|r| in_scope(r, filter))
            .count() as u64)
    }

    async fn export_batch(&self, request: &ExportRequest) -> Result<ExportBatch> {
        let n = {
            let mut requests = self.inner.requests.lock().unwrap();
            requests.push(request.after_id);
            requests.len()
        };
        if self.inner.fail_on_request == Some(n) {
            return Err(vecshift_core::Error::Connection("source went away".into()).into());
        }

        let scope = request.scope();
        let after = request.after_id.unwrap_or(i64::MIN);
        let rows = self
            .inner
            .records
            .iter()
            .filter(|r| in_scope(r, &scope))
            .filter_map(|r| {
                let id = r.numeric_id().ok()?;
                (id > after).then(|| (id, r.clone()))
            })
            .take(request.limit + 1)
            .collect();
        Ok(ExportBatch::from_rows(rows, request.limit))
    }

    async fn export_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VectorRecord>> {
        Ok(self
            .inner
            .records
            .iter()
            .filter(|r| r.create_time >= start && r.create_time <= end)
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Target
// -------------------------------------------------------------------------

/// Knobs for [`MemoryImporter`].
#[derive(Clone)]
pub struct TargetOptions {
    pub preserve_ids: bool,
    /// 1-based import calls that fail as a whole.
    pub fail_calls: Vec<usize>,
    /// Keyed ids the target acknowledges but never stores.
    pub lose_ids: Vec<i64>,
    /// Latency added to every import call.
    pub delay: Duration,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            preserve_ids: true,
            fail_calls: Vec::new(),
            lose_ids: Vec::new(),
            delay: Duration::ZERO,
        }
    }
}

struct TargetInner {
    rows: Mutex<BTreeMap<i64, VectorRecord>>,
    next_serial: AtomicI64,
    planner: IdPlanner,
    import_calls: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    options: TargetOptions,
}

#[async_trait]
impl BatchWriter for TargetInner {
    async fn existing(&self, ids: &[i64]) -> vecshift_core::Result<HashSet<i64>> {
        let rows = self.rows.lock().unwrap();
        Ok(ids.iter().copied().filter(|id| rows.contains_key(id)).collect())
    }

    async fn write_keyed(&self, keyed: &[KeyedRow<'_>]) -> vecshift_core::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for row in keyed {
            if self.options.lose_ids.contains(&row.id) {
                continue;
            }
            rows.entry(row.id).or_insert_with(|| VectorRecord {
                id: row.id.to_string(),
                ..row.record.clone()
            });
        }
        Ok(())
    }

    async fn write_assigned(&self, records: &[&VectorRecord]) -> vecshift_core::Result<Vec<i64>> {
        let mut rows = self.rows.lock().unwrap();
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = self.next_serial.fetch_add(1, Ordering::SeqCst);
            rows.insert(
                id,
                VectorRecord {
                    id: id.to_string(),
                    ..(*record).clone()
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Target table kept in a map, running the shared id rules.
#[derive(Clone)]
pub struct MemoryImporter {
    inner: Arc<TargetInner>,
}

impl MemoryImporter {
    pub fn new(options: TargetOptions) -> Self {
        Self {
            inner: Arc::new(TargetInner {
                rows: Mutex::new(BTreeMap::new()),
                next_serial: AtomicI64::new(FIRST_SERIAL),
                planner: IdPlanner::new(options.preserve_ids),
                import_calls: AtomicUsize::new(0),
                deleted: Mutex::new(Vec::new()),
                options,
            }),
        }
    }

    pub fn import_calls(&self) -> usize {
        self.inner.import_calls.load(Ordering::SeqCst)
    }

    pub fn stored_ids(&self) -> Vec<i64> {
        self.inner.rows.lock().unwrap().keys().copied().collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Importer for MemoryImporter {
    fn kind(&self) -> BackendKind {
        BackendKind::Milvus
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn import_batch(&self, records: &[VectorRecord]) -> Result<ImportOutcome> {
        let call = self.inner.import_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.inner.options.delay.is_zero() {
            tokio::time::sleep(self.inner.options.delay).await;
        }
        if self.inner.options.fail_calls.contains(&call) {
            return Err(vecshift_core::Error::Database("write rejected".into()).into());
        }
        import_records(&*self.inner, &self.inner.planner, DIMENSION, records).await
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<u64> {
        let mut rows = self.inner.rows.lock().unwrap();
        let mut removed = 0;
        for id in ids {
            if let Ok(n) = id.parse::<i64>() {
                if rows.remove(&n).is_some() {
                    removed += 1;
                }
            }
        }
        self.inner.deleted.lock().unwrap().extend(ids.iter().cloned());
        Ok(removed)
    }

    async fn count(&self, filter: &ScopeFilter) -> Result<u64> {
        let rows = self.inner.rows.lock().unwrap();
        Ok(rows.values().filter(|r| in_scope(r, filter)).count() as u64)
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let rows = self.inner.rows.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|id| id.parse::<i64>().is_ok_and(|n| rows.contains_key(&n)))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Factory
// -------------------------------------------------------------------------

/// Hands out clones of one source and one target.
#[derive(Clone)]
pub struct FakeFactory {
    pub exporter: FakeExporter,
    pub importer: MemoryImporter,
}

impl BackendFactory for FakeFactory {
    fn exporter(&self, _config: &MigrationConfig) -> Result<Box<dyn Exporter>> {
        Ok(Box::new(self.exporter.clone()))
    }

    fn importer(&self, _config: &MigrationConfig) -> Result<Arc<dyn Importer>> {
        Ok(Arc::new(self.importer.clone()))
    }
}
