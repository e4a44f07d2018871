//! Migration state machine, error records and run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use vecshift_core::types::BackendKind;

use crate::config::{MigrationConfig, MigrationMode};
use crate::error::{Error, Result};

/// Lifecycle of one migration run.
///
/// `idle → preparing → full_sync → completed | failed | cancelled`. Moves are
/// strictly forward and terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Created, not started.
    Idle,
    /// Initializing the target and counting the source.
    Preparing,
    /// Copying batches.
    FullSync,
    /// Every batch was processed.
    Completed,
    /// Aborted by an error.
    Failed,
    /// Aborted by the operator.
    Cancelled,
}

impl MigrationStatus {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::FullSync => "full_sync",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// True for `completed`, `failed` and `cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the machine may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use MigrationStatus::{Cancelled, Completed, Failed, FullSync, Idle, Preparing};
        match (self, next) {
            (Idle, Preparing) => true,
            (Preparing, FullSync | Failed | Cancelled) => true,
            (FullSync, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a recorded migration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationErrorKind {
    /// Backend unreachable.
    Connection,
    /// Backend too slow.
    Timeout,
    /// Record could not be decoded or does not fit the schema.
    DataCorruption,
    /// Target rejected an id.
    IdConflict,
    /// Post-migration checks disagree.
    ValidationFailed,
    /// Anything else.
    Unknown,
}

/// One entry of a run's append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationError {
    /// Classification.
    pub kind: MigrationErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Source record the error belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Whether a retry could succeed.
    pub retryable: bool,
}

impl MigrationError {
    /// Creates a non-retryable error of `kind`.
    pub fn new(kind: MigrationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            record_id: None,
            timestamp: Utc::now(),
            retryable: false,
        }
    }

    /// Attaches the offending record id.
    #[must_use]
    pub fn for_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Classifies a migration error.
    pub fn from_error(error: &Error, record_id: Option<String>) -> Self {
        use vecshift_core::Error as Store;

        let kind = match error {
            Error::Store(Store::Connection(_) | Store::Closed(_)) => MigrationErrorKind::Connection,
            Error::Store(Store::Timeout(_)) => MigrationErrorKind::Timeout,
            Error::Store(
                Store::DataCorruption(_)
                | Store::DimensionMismatch { .. }
                | Store::InvalidId(_)
                | Store::Serialization(_),
            ) => MigrationErrorKind::DataCorruption,
            Error::Store(Store::IdConflict(_)) => MigrationErrorKind::IdConflict,
            _ => MigrationErrorKind::Unknown,
        };
        Self {
            kind,
            message: error.to_string(),
            record_id,
            timestamp: Utc::now(),
            retryable: error.is_retryable(),
        }
    }
}

/// Persisted state of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    /// `migration_<unix millis>_<8 hex>`.
    pub migration_id: String,
    /// Current lifecycle state.
    pub status: MigrationStatus,
    /// Mode the run was started in.
    pub mode: MigrationMode,
    /// Source backend.
    pub source_type: BackendKind,
    /// Target backend.
    pub target_type: BackendKind,
    /// Records counted on the source during preparation.
    pub total_records: u64,
    /// Records present on the target after their batch.
    pub synced_records: u64,
    /// Records that could not be written.
    pub failed_records: u64,
    /// Start of the run.
    pub start_time: DateTime<Utc>,
    /// End of the run, once terminal.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Cursor of the last processed batch.
    #[serde(default)]
    pub last_id: Option<i64>,
    /// Run this one continues, if resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    /// Append-only error log.
    #[serde(default)]
    pub errors: Vec<MigrationError>,
}

impl MigrationState {
    /// Fresh `idle` state for `config`.
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            migration_id: new_migration_id(),
            status: MigrationStatus::Idle,
            mode: config.mode,
            source_type: config.source_type,
            target_type: config.target_type,
            total_records: 0,
            synced_records: 0,
            failed_records: 0,
            start_time: Utc::now(),
            end_time: None,
            last_id: None,
            resumed_from: None,
            errors: Vec::new(),
        }
    }

    /// Moves to `next`, refusing backward or post-terminal moves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] for an illegal transition.
    pub fn advance(&mut self, next: MigrationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::State(format!(
                "illegal transition {} -> {} for {}",
                self.status, next, self.migration_id
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Progress snapshot for a run using `batch_size`.
    #[must_use]
    pub fn progress(&self, batch_size: usize) -> MigrationProgress {
        let processed = self.synced_records + self.failed_records;
        let batch = batch_size.max(1) as u64;
        let percentage = if self.total_records == 0 {
            if self.status == MigrationStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (processed as f64 / self.total_records as f64 * 100.0).min(100.0)
        };
        MigrationProgress {
            total: self.total_records,
            completed: self.synced_records,
            failed: self.failed_records,
            percentage,
            current_batch: processed.div_ceil(batch),
            total_batches: self.total_records.div_ceil(batch),
        }
    }
}

/// Generates `migration_<unix millis>_<8 hex>`.
#[must_use]
pub fn new_migration_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("migration_{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Projection of a state's counters, reported after every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    /// Records to migrate.
    pub total: u64,
    /// Records migrated.
    pub completed: u64,
    /// Records that failed.
    pub failed: u64,
    /// Processed share of `total`, 0 to 100.
    pub percentage: f64,
    /// Batches processed.
    pub current_batch: u64,
    /// Batches expected.
    pub total_batches: u64,
}

/// Source and target counts after the copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountMatch {
    /// Records on the source.
    pub source: u64,
    /// Records on the target.
    pub target: u64,
    /// `source == target`.
    pub matched: bool,
}

/// Presence check of a sample of migrated ids on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SampleMatch {
    /// Ids looked up.
    pub checked: usize,
    /// Ids found.
    pub matched: usize,
    /// Ids missing from the target.
    pub mismatched_ids: Vec<String>,
}

/// Outcome of post-migration validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Both checks passed.
    pub passed: bool,
    /// Count parity.
    pub count_match: CountMatch,
    /// Sample presence.
    pub sample_match: SampleMatch,
}

impl ValidationResult {
    /// Combines both checks.
    #[must_use]
    pub fn new(count_match: CountMatch, sample_match: SampleMatch) -> Self {
        Self {
            passed: count_match.matched && sample_match.mismatched_ids.is_empty(),
            count_match,
            sample_match,
        }
    }
}

/// What a finished run reports to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// No errors and not cancelled.
    pub success: bool,
    /// Run id.
    pub migration_id: String,
    /// Final status.
    pub status: MigrationStatus,
    /// Records counted on the source.
    pub total_records: u64,
    /// Records present on the target.
    pub migrated_records: u64,
    /// Records that failed.
    pub failed_records: u64,
    /// Source id to target id for every record whose id changed.
    pub id_mappings: BTreeMap<String, String>,
    /// Error log of the run.
    pub errors: Vec<MigrationError>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Validation outcome, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl MigrationResult {
    /// Builds the result from a terminal state.
    #[must_use]
    pub fn from_state(
        state: &MigrationState,
        id_mappings: BTreeMap<String, String>,
        duration: Duration,
        validation: Option<ValidationResult>,
    ) -> Self {
        Self {
            success: state.errors.is_empty() && state.status == MigrationStatus::Completed,
            migration_id: state.migration_id.clone(),
            status: state.status,
            total_records: state.total_records,
            migrated_records: state.synced_records,
            failed_records: state.failed_records,
            id_mappings,
            errors: state.errors.clone(),
            duration,
            validation,
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
