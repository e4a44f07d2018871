//! Migration configuration, loaded from YAML.
//!
//! ```yaml
//! mode: offline
//! source_type: pg
//! target_type: milvus
//! target_config:
//!   address: http://localhost:19530
//!   token: root:Milvus
//! options:
//!   batch_size: 1000
//!   preserve_ids: true
//! ```
//!
//! The source connection comes from the store configuration
//! (`vecshift.toml`) unless `source_config` overrides it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use vecshift_core::store::milvus::MAX_QUERY_WINDOW;
use vecshift_core::types::BackendKind;

use crate::error::{Error, Result};

/// Migration mode. Only offline runs are implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// One-shot copy of everything present at start.
    #[default]
    Offline,
    /// Continuous replication.
    Online,
}

impl MigrationMode {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }
}

/// Address and credentials of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Connection URL (`postgres://`, `mysql://`) or REST address (`http://`).
    pub address: String,
    /// Bearer token (Milvus only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl EndpointConfig {
    /// Creates an endpoint without credentials.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
        }
    }
}

/// Where the migration writes to.
pub type TargetConfig = EndpointConfig;

/// Optional override of the source connection.
pub type SourceSettings = EndpointConfig;

/// Main migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Migration mode.
    #[serde(default)]
    pub mode: MigrationMode,
    /// Backend the records are read from.
    pub source_type: BackendKind,
    /// Source endpoint; the store configuration is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_config: Option<SourceSettings>,
    /// Backend the records are written to.
    pub target_type: BackendKind,
    /// Target endpoint.
    pub target_config: TargetConfig,
    /// Run options.
    #[serde(default)]
    pub options: MigrationOptions,
}

/// Migration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Records per export/import batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Run count and sample validation after the copy.
    #[serde(default = "default_true")]
    pub validate_after_migration: bool,
    /// Carry source ids over to the target.
    #[serde(default = "default_true")]
    pub preserve_ids: bool,
    /// Import batches in flight when `parallel_import` is set.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Overlap imports of consecutive batches.
    #[serde(default)]
    pub parallel_import: bool,
    /// Delete what this run inserted when it fails.
    #[serde(default)]
    pub rollback_on_failure: bool,
    /// Number of migrated ids checked on the target during validation.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            validate_after_migration: true,
            preserve_ids: true,
            concurrency: default_concurrency(),
            parallel_import: false,
            rollback_on_failure: false,
            sample_size: default_sample_size(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_concurrency() -> usize {
    3
}

fn default_sample_size() -> usize {
    20
}

fn default_true() -> bool {
    true
}

impl MigrationConfig {
    /// Creates an offline configuration with default options.
    pub fn offline(source_type: BackendKind, target_type: BackendKind, target: TargetConfig) -> Self {
        Self {
            mode: MigrationMode::Offline,
            source_type,
            source_config: None,
            target_type,
            target_config: target,
            options: MigrationOptions::default(),
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        let options = &self.options;
        if options.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        // Exports fetch one extra row to detect the last page; imports look
        // up a whole batch of ids in one query.
        let touches_milvus =
            self.source_type == BackendKind::Milvus || self.target_type == BackendKind::Milvus;
        if touches_milvus && options.batch_size >= MAX_QUERY_WINDOW {
            return Err(Error::Config(format!(
                "batch_size must be below {MAX_QUERY_WINDOW} when milvus is the source or target"
            )));
        }
        if options.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.target_config.address.trim().is_empty() {
            return Err(Error::Config("target_config.address cannot be empty".to_string()));
        }
        if let Some(source) = &self.source_config {
            if source.address.trim().is_empty() {
                return Err(Error::Config("source_config.address cannot be empty".to_string()));
            }
            if self.source_type == self.target_type && source.address == self.target_config.address {
                return Err(Error::Config(
                    "source and target point at the same backend".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = MigrationOptions::default();
        assert_eq!(options.batch_size, 1000);
        assert!(options.validate_after_migration);
        assert!(options.preserve_ids);
        assert_eq!(options.concurrency, 3);
        assert!(!options.parallel_import);
        assert!(!options.rollback_on_failure);
        assert_eq!(options.sample_size, 20);
    }

    #[test]
    fn test_config_yaml_parse() {
        let yaml = r#"
source_type: pgvector
target_type: milvus
target_config:
  address: http://localhost:19530
  token: root:Milvus
options:
  batch_size: 500
  parallel_import: true
"#;
        let config = MigrationConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.mode, MigrationMode::Offline);
        assert_eq!(config.source_type, BackendKind::Pg);
        assert_eq!(config.target_type, BackendKind::Milvus);
        assert_eq!(config.target_config.token.as_deref(), Some("root:Milvus"));
        assert_eq!(config.options.batch_size, 500);
        assert!(config.options.parallel_import);
        assert_eq!(config.options.sample_size, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_yaml_rejects_unknown_backend() {
        let yaml = r#"
source_type: qdrant
target_type: milvus
target_config:
  address: http://localhost:19530
"#;
        assert!(matches!(MigrationConfig::from_yaml(yaml), Err(Error::Yaml(_))));
    }

    #[test]
    fn test_config_validate_batch_size() {
        let mut config = MigrationConfig::offline(
            BackendKind::Pg,
            BackendKind::OceanBase,
            EndpointConfig::new("mysql://root@localhost:2881/test"),
        );
        config.options.batch_size = 0;

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_validate_milvus_query_window() {
        let mut config = MigrationConfig::offline(
            BackendKind::Milvus,
            BackendKind::Pg,
            EndpointConfig::new("postgres://localhost/vectors"),
        );
        config.options.batch_size = MAX_QUERY_WINDOW;

        assert!(config.validate().is_err());

        config.options.batch_size = MAX_QUERY_WINDOW - 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_milvus_target_query_window() {
        let mut config = MigrationConfig::offline(
            BackendKind::Pg,
            BackendKind::Milvus,
            EndpointConfig::new("http://localhost:19530"),
        );
        config.options.batch_size = 20_000;

        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.options.batch_size = MAX_QUERY_WINDOW - 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_same_endpoint() {
        let mut config = MigrationConfig::offline(
            BackendKind::Pg,
            BackendKind::Pg,
            EndpointConfig::new("postgres://localhost/vectors"),
        );
        config.source_config = Some(EndpointConfig::new("postgres://localhost/vectors"));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_empty_target() {
        let config =
            MigrationConfig::offline(BackendKind::Pg, BackendKind::Milvus, EndpointConfig::new(" "));

        assert!(config.validate().is_err());
    }
}
