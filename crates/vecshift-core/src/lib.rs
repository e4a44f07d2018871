//! # `vecshift` Core
//!
//! One vector-store contract over three incompatible backends: PostgreSQL
//! with `pgvector`, OceanBase and Milvus.
//!
//! Every record is scoped by a `(team_id, dataset_id, collection_id)` tuple
//! and carries a fixed-dimension `f32` embedding. Searches rank by inner
//! product, higher score first, on every backend.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vecshift_core::{Backends, BackendKind, RecallRequest, StoreConfig, TenantScope};
//!
//! let backends = Backends::new(StoreConfig::load()?);
//! let store = backends.store(BackendKind::Pg)?;
//! store.init().await?;
//!
//! let scope = TenantScope::new("team", "dataset", "collection");
//! let ids = store.insert(&scope, &[vec![0.1; 1536]]).await?;
//!
//! let hits = store
//!     .emb_recall(&RecallRequest::new("team", vec!["dataset".into()], vec![0.1; 1536], 10))
//!     .await?;
//! backends.close().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::needless_pass_by_value)]

pub mod config;
pub mod connection;
#[cfg(test)]
mod connection_tests;
pub mod error;
#[cfg(test)]
mod error_tests;
pub mod filter;
pub mod http;
pub mod ids;
pub mod retry;
#[cfg(test)]
mod retry_tests;
pub mod store;
pub mod types;
pub mod vector_text;

pub use config::StoreConfig;
pub use connection::{ConnectionManager, Connector};
pub use error::{Error, Result};
pub use filter::CollectionFilter;
pub use ids::IdGenerator;
pub use store::{Backends, VectorStore};
pub use types::{
    BackendKind, DeleteSelector, RecallRequest, RecallResult, TenantScope, TimedVectorRef,
    VectorRecord, MAX_SAFE_ID,
};
