//! Persistence of migration states.
//!
//! The controller writes its state after every transition and every batch,
//! so a crashed or cancelled run can be inspected and resumed from its
//! `last_id`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::state::MigrationState;

/// Keyed storage for [`MigrationState`]s.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// State of `migration_id`, if known.
    async fn get(&self, migration_id: &str) -> Result<Option<MigrationState>>;

    /// Inserts or replaces a state.
    async fn put(&self, state: &MigrationState) -> Result<()>;

    /// Every known state, oldest first.
    async fn list(&self) -> Result<Vec<MigrationState>>;
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, MigrationState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, migration_id: &str) -> Result<Option<MigrationState>> {
        Ok(self.states.read().await.get(migration_id).cloned())
    }

    async fn put(&self, state: &MigrationState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(state.migration_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MigrationState>> {
        let mut states: Vec<MigrationState> = self.states.read().await.values().cloned().collect();
        sort_by_start(&mut states);
        Ok(states)
    }
}

/// One JSON file per migration under a directory.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Uses `dir`, creating it on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the state files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, migration_id: &str) -> Result<PathBuf> {
        let valid = !migration_id.is_empty()
            && migration_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::State(format!("invalid migration id '{migration_id}'")));
        }
        Ok(self.dir.join(format!("{migration_id}.json")))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, migration_id: &str) -> Result<Option<MigrationState>> {
        let path = self.path_for(migration_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, state: &MigrationState) -> Result<()> {
        let path = self.path_for(&state.migration_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write then rename so readers never see a torn file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), status = %state.status, "migration state saved");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MigrationState>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            states.push(serde_json::from_slice(&bytes)?);
        }
        sort_by_start(&mut states);
        Ok(states)
    }
}

fn sort_by_start(states: &mut [MigrationState]) {
    states.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.migration_id.cmp(&b.migration_id))
    });
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
