// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # vecshift migration
//!
//! `vecshift-migrate` copies the knowledge-base vector table of one backend
//! into another while preserving record ids where it can.
//!
//! ## Supported Backends
//!
//! | Backend | Export | Import | Notes |
//! |---------|--------|--------|-------|
//! | pgvector | ✅ | ✅ | Keyed inserts resync the id sequence |
//! | OceanBase | ✅ | ✅ | `INSERT IGNORE` on existing ids |
//! | Milvus | ✅ | ✅ | REST v2, collection must not use `autoId` |
//!
//! Only offline (one-shot) migration is implemented.
//!
//! ## Quick Start
//!
//! ```bash
//! vecshift-migrate init --source pg --target milvus --output migration.yaml
//! vecshift-migrate count --config migration.yaml
//! vecshift-migrate run --config migration.yaml
//! vecshift-migrate status
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! mode: offline
//! source_type: pg
//! target_type: milvus
//! target_config:
//!   address: http://localhost:19530
//! options:
//!   batch_size: 1000
//!   validate_after_migration: true
//!   preserve_ids: true
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod exporter;
pub mod id_map;
pub mod importer;
pub mod service;
pub mod state;
pub mod store;

pub use config::{EndpointConfig, MigrationConfig, MigrationMode, MigrationOptions, TargetConfig};
pub use controller::{MigrationController, ProgressCallback};
pub use error::{Error, Result};
pub use exporter::{create_exporter, ExportBatch, ExportRequest, Exporter, ScopeFilter};
pub use importer::{create_importer, ImportOutcome, Importer, ImporterSettings};
pub use service::{BackendFactory, DefaultFactory, MigrationService, StartOptions};
pub use state::{
    MigrationError, MigrationErrorKind, MigrationProgress, MigrationResult, MigrationState,
    MigrationStatus, ValidationResult,
};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
