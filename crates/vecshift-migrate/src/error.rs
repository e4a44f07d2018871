//! Error types for the migration layer.

use thiserror::Error;

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Migration errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Failure reported by a backend or by the shared store layer.
    #[error(transparent)]
    Store(#[from] vecshift_core::Error),

    /// Invalid migration configuration.
    #[error("[MIG-001] Configuration error: {0}")]
    Config(String),

    /// YAML parse error.
    #[error("[MIG-002] YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Illegal state transition or unusable persisted state.
    #[error("[MIG-003] State error: {0}")]
    State(String),

    /// Requested mode has no implementation.
    #[error("[MIG-004] Not implemented: {0}")]
    NotImplemented(String),

    /// Unknown migration id.
    #[error("[MIG-005] Migration not found: {0}")]
    NotFound(String),

    /// IO error (config and state files).
    #[error("[MIG-006] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (state files).
    #[error("[MIG-007] JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.code(),
            Self::Config(_) => "MIG-001",
            Self::Yaml(_) => "MIG-002",
            Self::State(_) => "MIG-003",
            Self::NotImplemented(_) => "MIG-004",
            Self::NotFound(_) => "MIG-005",
            Self::Io(_) => "MIG-006",
            Self::Json(_) => "MIG-007",
        }
    }

    /// Whether a retry of the same call could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => vecshift_core::retry::is_retryable_error(e),
            Self::Io(_) => true,
            _ => false,
        }
    }
}
