//! Entry point for running, tracking and aborting migrations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use vecshift_core::Backends;

use crate::config::{MigrationConfig, MigrationMode};
use crate::controller::{MigrationController, ProgressCallback};
use crate::error::{Error, Result};
use crate::exporter::{create_exporter, Exporter, ScopeFilter};
use crate::importer::{create_importer, Importer, ImporterSettings};
use crate::state::{MigrationResult, MigrationState, MigrationStatus};
use crate::store::StateStore;

/// Builds the exporter and importer a configuration asks for.
pub trait BackendFactory: Send + Sync {
    /// Source side.
    fn exporter(&self, config: &MigrationConfig) -> Result<Box<dyn Exporter>>;

    /// Target side.
    fn importer(&self, config: &MigrationConfig) -> Result<Arc<dyn Importer>>;
}

/// Factory over the shared [`Backends`] registry.
///
/// Sources without an explicit endpoint read through the registry's
/// connection; importers always get their own.
pub struct DefaultFactory {
    backends: Arc<Backends>,
}

impl DefaultFactory {
    /// Wraps `backends`.
    pub fn new(backends: Arc<Backends>) -> Self {
        Self { backends }
    }
}

impl BackendFactory for DefaultFactory {
    fn exporter(&self, config: &MigrationConfig) -> Result<Box<dyn Exporter>> {
        create_exporter(config.source_type, config.source_config.as_ref(), &self.backends)
    }

    fn importer(&self, config: &MigrationConfig) -> Result<Arc<dyn Importer>> {
        let settings =
            ImporterSettings::from_store(self.backends.config(), config.options.preserve_ids);
        let importer = create_importer(config.target_type, &config.target_config, &settings)?;
        Ok(Arc::from(importer))
    }
}

/// Per-run knobs that are not part of the migration file.
#[derive(Clone, Default)]
pub struct StartOptions {
    /// Only this team.
    pub team_id: Option<String>,
    /// Only this dataset.
    pub dataset_id: Option<String>,
    /// Called after every batch.
    pub on_progress: Option<ProgressCallback>,
    /// Skip source ids up to and including this one.
    pub resume_after: Option<i64>,
    /// Externally owned abort flag, e.g. wired to Ctrl-C.
    pub abort: Option<Arc<AtomicBool>>,
}

/// Runs migrations and keeps their state.
pub struct MigrationService {
    factory: Arc<dyn BackendFactory>,
    store: Arc<dyn StateStore>,
    active: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl MigrationService {
    /// Creates a service persisting to `store`.
    pub fn new(factory: Arc<dyn BackendFactory>, store: Arc<dyn StateStore>) -> Self {
        Self {
            factory,
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Runs a migration to completion.
    ///
    /// # Errors
    ///
    /// Fails before any data moves when the configuration is invalid, the
    /// mode is online, or a backend cannot be constructed. Once running, the
    /// outcome is reported through the returned [`MigrationResult`].
    pub async fn start_migration(
        &self,
        config: MigrationConfig,
        options: StartOptions,
    ) -> Result<MigrationResult> {
        self.launch(config, options, None).await
    }

    /// Continues a cancelled or failed run from its last applied id.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id, [`Error::State`] when the run
    /// completed already or is still active.
    pub async fn resume_migration(
        &self,
        previous_id: &str,
        config: MigrationConfig,
        options: StartOptions,
    ) -> Result<MigrationResult> {
        let previous = self
            .store
            .get(previous_id)
            .await?
            .ok_or_else(|| Error::NotFound(previous_id.to_string()))?;

        if previous.status == MigrationStatus::Completed {
            return Err(Error::State(format!(
                "migration {previous_id} already completed"
            )));
        }
        if self.active().contains_key(previous_id) {
            return Err(Error::State(format!("migration {previous_id} is still running")));
        }
        if previous.source_type != config.source_type || previous.target_type != config.target_type
        {
            return Err(Error::Config(format!(
                "migration {previous_id} ran {} -> {}, not {} -> {}",
                previous.source_type, previous.target_type, config.source_type, config.target_type
            )));
        }

        self.launch(config, options, Some(previous)).await
    }

    /// Persisted state of one run.
    pub async fn get_migration_state(&self, migration_id: &str) -> Result<Option<MigrationState>> {
        self.store.get(migration_id).await
    }

    /// All persisted runs, oldest first.
    pub async fn list_migration_states(&self) -> Result<Vec<MigrationState>> {
        self.store.list().await
    }

    /// Asks a running migration to stop. False when it is not running here.
    pub fn abort_migration(&self, migration_id: &str) -> bool {
        match self.active().get(migration_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(migration_id, "abort requested");
                true
            }
            None => false,
        }
    }

    async fn launch(
        &self,
        config: MigrationConfig,
        options: StartOptions,
        previous: Option<MigrationState>,
    ) -> Result<MigrationResult> {
        config.validate()?;
        if config.mode == MigrationMode::Online {
            return Err(Error::NotImplemented("online migration".to_string()));
        }

        let exporter = self.factory.exporter(&config)?;
        let importer = self.factory.importer(&config)?;
        let scope = ScopeFilter {
            team_id: options.team_id,
            dataset_id: options.dataset_id,
        };

        let mut controller =
            MigrationController::new(config, exporter, importer, Arc::clone(&self.store))
                .with_scope(scope);
        if let Some(callback) = options.on_progress {
            controller = controller.with_progress(callback);
        }
        if let Some(flag) = options.abort {
            controller = controller.with_abort_flag(flag);
        }
        controller = match previous {
            Some(previous) => controller.resume_from(&previous),
            None => controller.starting_after(options.resume_after),
        };

        let migration_id = controller.migration_id().to_string();
        self.active()
            .insert(migration_id.clone(), controller.abort_handle());

        let result = controller.run_offline_migration().await;

        self.active().remove(&migration_id);
        controller.close().await;
        if !result.success {
            warn!(
                migration_id = %migration_id,
                status = %result.status,
                errors = result.errors.len(),
                "migration finished with errors"
            );
        }
        Ok(result)
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
