//! Error types for `vecshift` vector-store operations.
//!
//! Every backend adapter, the connection manager and the migration layer
//! funnel their failures through [`Error`]. Each variant carries a stable
//! code of the form `VS-XXX` so operators can grep logs across backends.

use thiserror::Error;

/// Result type alias for vector-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a vector backend.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend unreachable or connection dropped (VS-001).
    #[error("[VS-001] Connection error: {0}")]
    Connection(String),

    /// Operation timed out (VS-002).
    #[error("[VS-002] Timeout: {0}")]
    Timeout(String),

    /// Query rejected or failed inside the database (VS-003).
    #[error("[VS-003] Database error: {0}")]
    Database(String),

    /// Stored data could not be decoded (VS-004).
    ///
    /// Raised for malformed vector text, missing columns and rows that do not
    /// match the expected schema.
    #[error("[VS-004] Data corruption: {0}")]
    DataCorruption(String),

    /// Vector dimension does not match the schema (VS-005).
    #[error("[VS-005] Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension fixed by the schema.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },

    /// Identifier is not a valid backend id (VS-006).
    #[error("[VS-006] Invalid id '{0}'")]
    InvalidId(String),

    /// Target rejected a duplicate or overflowing id (VS-007).
    #[error("[VS-007] Id conflict: {0}")]
    IdConflict(String),

    /// Configuration error (VS-008).
    #[error("[VS-008] Configuration error: {0}")]
    Config(String),

    /// HTTP transport error (VS-009).
    #[error("[VS-009] HTTP error: {0}")]
    Http(String),

    /// Credentials rejected by the backend (VS-010).
    #[error("[VS-010] Authentication failed: {0}")]
    Authentication(String),

    /// Backend asked us to slow down; value is the suggested wait in seconds (VS-011).
    #[error("[VS-011] Rate limited, retry after {0}s")]
    RateLimit(u64),

    /// Backend answered with an application-level error code (VS-012).
    #[error("[VS-012] Backend error {code}: {message}")]
    Backend {
        /// Backend-specific error code.
        code: i64,
        /// Backend-provided message.
        message: String,
    },

    /// Feature exists in the contract but has no implementation (VS-013).
    #[error("[VS-013] Not implemented: {0}")]
    NotImplemented(String),

    /// IO error (VS-014).
    #[error("[VS-014] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (VS-015).
    #[error("[VS-015] Serialization error: {0}")]
    Serialization(String),

    /// Connection manager was closed by its owner (VS-016).
    #[error("[VS-016] Connection manager for {0} is closed")]
    Closed(String),
}

impl Error {
    /// Returns the error code (e.g., "VS-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "VS-001",
            Self::Timeout(_) => "VS-002",
            Self::Database(_) => "VS-003",
            Self::DataCorruption(_) => "VS-004",
            Self::DimensionMismatch { .. } => "VS-005",
            Self::InvalidId(_) => "VS-006",
            Self::IdConflict(_) => "VS-007",
            Self::Config(_) => "VS-008",
            Self::Http(_) => "VS-009",
            Self::Authentication(_) => "VS-010",
            Self::RateLimit(_) => "VS-011",
            Self::Backend { .. } => "VS-012",
            Self::NotImplemented(_) => "VS-013",
            Self::Io(_) => "VS-014",
            Self::Serialization(_) => "VS-015",
            Self::Closed(_) => "VS-016",
        }
    }

    /// Returns true when the underlying connection handle is unusable and
    /// must be torn down and re-established.
    #[must_use]
    pub const fn is_fatal_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                Self::Timeout("timed out acquiring a pooled connection".into())
            }
            sqlx::Error::PoolClosed => Self::Connection("connection pool closed".into()),
            sqlx::Error::Io(e) => Self::Connection(e.to_string()),
            sqlx::Error::Tls(e) => Self::Connection(e.to_string()),
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    Self::IdConflict(db.message().to_string())
                } else {
                    Self::Database(db.message().to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::RowNotFound => Self::DataCorruption(err.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
