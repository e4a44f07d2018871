//! The offline migration loop.
//!
//! ```text
//! idle ─► preparing ─► full_sync ─┬─► completed
//!              │                  ├─► cancelled
//!              └──────────────────┴─► failed
//! ```
//!
//! Preparation initializes the target and counts the source. The copy phase
//! pages through the source by ascending id and hands every page to the
//! importer; state is persisted and progress reported after each batch. An
//! import failure is recorded and the loop moves on. An export failure that
//! survives the exporter's retries ends the run, since the cursor cannot
//! advance past a page it never read.

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MigrationConfig, MigrationMode};
use crate::error::{Error, Result};
use crate::exporter::{ExportRequest, Exporter, ScopeFilter};
use crate::importer::{ImportOutcome, Importer};
use crate::state::{
    CountMatch, MigrationError, MigrationErrorKind, MigrationProgress, MigrationResult,
    MigrationState, MigrationStatus, SampleMatch, ValidationResult,
};
use crate::store::StateStore;

/// Called after every batch with the current progress.
pub type ProgressCallback = Arc<dyn Fn(&MigrationProgress) + Send + Sync>;

type PendingImport = (usize, Option<i64>, JoinHandle<Result<ImportOutcome>>);

/// Drives one migration run.
pub struct MigrationController {
    config: MigrationConfig,
    exporter: Box<dyn Exporter>,
    importer: Arc<dyn Importer>,
    store: Arc<dyn StateStore>,
    state: MigrationState,
    scope: ScopeFilter,
    cursor: Option<i64>,
    abort: Arc<AtomicBool>,
    on_progress: Option<ProgressCallback>,
    id_mappings: BTreeMap<String, String>,
    inserted: Vec<String>,
    sample: Vec<String>,
    seen: u64,
}

impl MigrationController {
    /// Creates an `idle` controller.
    pub fn new(
        config: MigrationConfig,
        exporter: Box<dyn Exporter>,
        importer: Arc<dyn Importer>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let state = MigrationState::new(&config);
        Self {
            config,
            exporter,
            importer,
            store,
            state,
            scope: ScopeFilter::default(),
            cursor: None,
            abort: Arc::new(AtomicBool::new(false)),
            on_progress: None,
            id_mappings: BTreeMap::new(),
            inserted: Vec::new(),
            sample: Vec::new(),
            seen: 0,
        }
    }

    /// Restricts the run to a team and/or dataset.
    #[must_use]
    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = scope;
        self
    }

    /// Registers a progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Uses an externally owned abort flag.
    #[must_use]
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    /// Starts the copy after `after_id` instead of at the beginning.
    #[must_use]
    pub fn starting_after(mut self, after_id: Option<i64>) -> Self {
        self.cursor = after_id;
        self.state.last_id = after_id;
        self
    }

    /// Continues `previous`: same cursor, counters carried over.
    #[must_use]
    pub fn resume_from(mut self, previous: &MigrationState) -> Self {
        self.state.synced_records = previous.synced_records;
        self.state.failed_records = previous.failed_records;
        self.state.resumed_from = Some(previous.migration_id.clone());
        self.starting_after(previous.last_id)
    }

    /// Id of this run.
    pub fn migration_id(&self) -> &str {
        &self.state.migration_id
    }

    /// Flag that stops the loop before its next batch.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Requests cancellation. In-flight batches finish first.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Current state.
    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    /// Progress derived from the current counters.
    pub fn progress(&self) -> MigrationProgress {
        self.state.progress(self.config.options.batch_size)
    }

    /// Runs the configured mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotImplemented`] for online mode. Offline runs always
    /// produce a [`MigrationResult`], failed or not.
    pub async fn run(&mut self) -> Result<MigrationResult> {
        match self.config.mode {
            MigrationMode::Offline => Ok(self.run_offline_migration().await),
            MigrationMode::Online => Err(Error::NotImplemented("online migration".to_string())),
        }
    }

    /// Copies every source record to the target.
    pub async fn run_offline_migration(&mut self) -> MigrationResult {
        let started = Instant::now();
        info!(
            migration_id = %self.state.migration_id,
            source = %self.state.source_type,
            target = %self.state.target_type,
            resume_after = ?self.cursor,
            "migration started"
        );

        if let Err(e) = self.transition(MigrationStatus::Preparing).await {
            return self.fail(e, started).await;
        }
        match self.prepare().await {
            Ok(total) => self.state.total_records = total,
            Err(e) => return self.fail(e, started).await,
        }
        if let Err(e) = self.transition(MigrationStatus::FullSync).await {
            return self.fail(e, started).await;
        }

        if self.state.total_records == 0 {
            info!(migration_id = %self.state.migration_id, "source is empty, nothing to copy");
            return self.complete(None, started).await;
        }

        let parallel = self.config.options.parallel_import && self.config.options.concurrency > 1;
        let copied = if parallel {
            self.copy_parallel().await
        } else {
            self.copy_sequential().await
        };
        if let Err(e) = copied {
            return self.fail(e, started).await;
        }

        if self.is_aborted() {
            return self.cancel(started).await;
        }

        let validation = if self.config.options.validate_after_migration {
            self.run_validation().await
        } else {
            None
        };
        self.complete(validation, started).await
    }

    /// Releases exporter and importer connections.
    pub async fn close(&self) {
        if let Err(e) = self.exporter.close().await {
            warn!("closing exporter failed: {}", e);
        }
        if let Err(e) = self.importer.close().await {
            warn!("closing importer failed: {}", e);
        }
    }

    async fn prepare(&self) -> Result<u64> {
        self.importer.init().await?;
        let total = self.exporter.count(&self.scope).await?;
        info!(migration_id = %self.state.migration_id, total, "source counted");
        Ok(total)
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn next_request(&self, after_id: Option<i64>) -> ExportRequest {
        ExportRequest {
            after_id,
            limit: self.config.options.batch_size,
            team_id: self.scope.team_id.clone(),
            dataset_id: self.scope.dataset_id.clone(),
        }
    }

    async fn copy_sequential(&mut self) -> Result<()> {
        loop {
            if self.is_aborted() {
                info!(migration_id = %self.state.migration_id, "abort requested");
                return Ok(());
            }
            let request = self.next_request(self.cursor);
            let batch = self.exporter.export_batch(&request).await?;
            if batch.records.is_empty() {
                return Ok(());
            }

            let outcome = self.importer.import_batch(&batch.records).await;
            self.apply(batch.records.len(), batch.last_id, outcome);
            self.checkpoint().await;

            if !batch.has_more {
                return Ok(());
            }
        }
    }

    /// Exports stay sequential; up to `concurrency` imports run at once and
    /// are applied in export order.
    async fn copy_parallel(&mut self) -> Result<()> {
        let limit = self.config.options.concurrency;
        let mut in_flight: VecDeque<PendingImport> = VecDeque::with_capacity(limit);
        let mut export_cursor = self.cursor;
        let mut export_error = None;

        loop {
            if self.is_aborted() {
                info!(migration_id = %self.state.migration_id, "abort requested");
                break;
            }
            let request = self.next_request(export_cursor);
            let batch = match self.exporter.export_batch(&request).await {
                Ok(batch) => batch,
                Err(e) => {
                    export_error = Some(e);
                    break;
                }
            };
            if batch.records.is_empty() {
                break;
            }

            export_cursor = batch.last_id;
            let has_more = batch.has_more;
            let records = batch.records;
            let count = records.len();
            let importer = Arc::clone(&self.importer);
            let handle = tokio::spawn(async move { importer.import_batch(&records).await });
            in_flight.push_back((count, batch.last_id, handle));

            while in_flight.len() >= limit {
                if let Some(pending) = in_flight.pop_front() {
                    self.finish(pending).await;
                }
            }
            if !has_more {
                break;
            }
        }

        while let Some(pending) = in_flight.pop_front() {
            self.finish(pending).await;
        }
        export_error.map_or(Ok(()), Err)
    }

    async fn finish(&mut self, (count, last_id, handle): PendingImport) {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::State(format!("import task failed: {e}"))),
        };
        self.apply(count, last_id, outcome);
        self.checkpoint().await;
    }

    fn apply(&mut self, count: usize, last_id: Option<i64>, outcome: Result<ImportOutcome>) {
        match outcome {
            Ok(outcome) => {
                self.state.synced_records += outcome.migrated();
                self.state.failed_records += outcome.errors.len() as u64;
                for id in outcome.inserted_ids.iter().chain(&outcome.skipped_ids) {
                    self.consider_for_sample(id);
                }
                self.inserted.extend(outcome.inserted_ids);
                self.id_mappings.extend(outcome.id_mappings);
                self.state.errors.extend(outcome.errors);
            }
            Err(e) => {
                error!(
                    migration_id = %self.state.migration_id,
                    records = count,
                    "batch import failed: {}",
                    e
                );
                self.state.failed_records += count as u64;
                let mut recorded = MigrationError::from_error(&e, None);
                recorded.message = format!(
                    "batch of {count} records up to id {} failed: {}",
                    last_id.map_or_else(|| "?".to_string(), |id| id.to_string()),
                    recorded.message
                );
                self.state.errors.push(recorded);
            }
        }

        self.cursor = last_id.or(self.cursor);
        self.state.last_id = self.cursor;
        debug!(
            migration_id = %self.state.migration_id,
            last_id = ?self.cursor,
            synced = self.state.synced_records,
            failed = self.state.failed_records,
            "batch applied"
        );
    }

    /// Spreads the validation sample evenly over the expected records.
    fn consider_for_sample(&mut self, target_id: &str) {
        let size = self.config.options.sample_size;
        let stride = (self.state.total_records / size.max(1) as u64).max(1);
        if self.sample.len() < size && self.seen % stride == 0 {
            self.sample.push(target_id.to_string());
        }
        self.seen += 1;
    }

    async fn checkpoint(&self) {
        self.persist().await;
        if let Some(callback) = &self.on_progress {
            callback(&self.progress());
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.put(&self.state).await {
            warn!(migration_id = %self.state.migration_id, "persisting state failed: {}", e);
        }
    }

    async fn transition(&mut self, next: MigrationStatus) -> Result<()> {
        let from = self.state.status;
        self.state.advance(next)?;
        info!(migration_id = %self.state.migration_id, from = %from, to = %next, "state transition");
        self.persist().await;
        Ok(())
    }

    async fn run_validation(&mut self) -> Option<ValidationResult> {
        match self.validate().await {
            Ok(result) => {
                if result.passed {
                    info!(migration_id = %self.state.migration_id, "validation passed");
                } else {
                    let message = format!(
                        "validation failed: source has {} records, target has {}; {} of {} sampled ids missing",
                        result.count_match.source,
                        result.count_match.target,
                        result.sample_match.mismatched_ids.len(),
                        result.sample_match.checked
                    );
                    warn!(migration_id = %self.state.migration_id, "{}", message);
                    self.state
                        .errors
                        .push(MigrationError::new(MigrationErrorKind::ValidationFailed, message));
                }
                Some(result)
            }
            Err(e) => {
                warn!(migration_id = %self.state.migration_id, "validation could not run: {}", e);
                let mut recorded = MigrationError::from_error(&e, None);
                recorded.kind = MigrationErrorKind::ValidationFailed;
                recorded.message = format!("validation could not run: {}", recorded.message);
                self.state.errors.push(recorded);
                None
            }
        }
    }

    async fn validate(&self) -> Result<ValidationResult> {
        let source = self.exporter.count(&self.scope).await?;
        let target = self.importer.count(&self.scope).await?;

        let present: HashSet<String> = if self.sample.is_empty() {
            HashSet::new()
        } else {
            self.importer
                .existing_ids(&self.sample)
                .await?
                .into_iter()
                .collect()
        };
        let mismatched_ids: Vec<String> = self
            .sample
            .iter()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();

        Ok(ValidationResult::new(
            CountMatch {
                source,
                target,
                matched: source == target,
            },
            SampleMatch {
                checked: self.sample.len(),
                matched: self.sample.len() - mismatched_ids.len(),
                mismatched_ids,
            },
        ))
    }

    async fn complete(&mut self, validation: Option<ValidationResult>, started: Instant) -> MigrationResult {
        if let Err(e) = self.transition(MigrationStatus::Completed).await {
            return self.fail(e, started).await;
        }
        info!(
            migration_id = %self.state.migration_id,
            migrated = self.state.synced_records,
            failed = self.state.failed_records,
            errors = self.state.errors.len(),
            elapsed = ?started.elapsed(),
            "migration completed"
        );
        self.result(validation, started)
    }

    async fn cancel(&mut self, started: Instant) -> MigrationResult {
        if let Err(e) = self.transition(MigrationStatus::Cancelled).await {
            return self.fail(e, started).await;
        }
        warn!(
            migration_id = %self.state.migration_id,
            migrated = self.state.synced_records,
            last_id = ?self.state.last_id,
            "migration cancelled"
        );
        self.result(None, started)
    }

    async fn fail(&mut self, cause: Error, started: Instant) -> MigrationResult {
        error!(migration_id = %self.state.migration_id, "migration failed: {}", cause);
        let mut recorded = MigrationError::new(
            MigrationErrorKind::Unknown,
            format!("migration failed: {cause}"),
        );
        recorded.retryable = cause.is_retryable();
        self.state.errors.push(recorded);

        if self.config.options.rollback_on_failure && !self.inserted.is_empty() {
            self.rollback().await;
        }

        if self.state.status.can_transition_to(MigrationStatus::Failed) {
            if let Err(e) = self.state.advance(MigrationStatus::Failed) {
                warn!("{}", e);
            }
            self.persist().await;
        } else {
            warn!(
                migration_id = %self.state.migration_id,
                status = %self.state.status,
                "cannot mark migration failed from its current state"
            );
        }
        self.result(None, started)
    }

    async fn rollback(&mut self) {
        let ids = std::mem::take(&mut self.inserted);
        warn!(migration_id = %self.state.migration_id, records = ids.len(), "rolling back inserted records");
        let mut deleted = 0;
        for chunk in ids.chunks(self.config.options.batch_size.max(1)) {
            match self.importer.delete_batch(chunk).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    error!(migration_id = %self.state.migration_id, "rollback failed: {}", e);
                    let mut recorded = MigrationError::from_error(&e, None);
                    recorded.message = format!("rollback failed: {}", recorded.message);
                    self.state.errors.push(recorded);
                    return;
                }
            }
        }
        info!(migration_id = %self.state.migration_id, deleted, "rollback finished");
    }

    fn result(&self, validation: Option<ValidationResult>, started: Instant) -> MigrationResult {
        MigrationResult::from_state(&self.state, self.id_mappings.clone(), started.elapsed(), validation)
    }
}

/// Progress bar for interactive runs.
#[must_use]
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Callback that mirrors progress onto `pb`.
pub fn progress_bar_callback(pb: ProgressBar) -> ProgressCallback {
    Arc::new(move |progress: &MigrationProgress| {
        if pb.length() != Some(progress.total) {
            pb.set_length(progress.total);
        }
        pb.set_position(progress.completed + progress.failed);
        if progress.failed > 0 {
            pb.set_message(format!("{} failed", progress.failed));
        }
    })
}
