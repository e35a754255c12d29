//! Error types for the replication engine
//!
//! Two layers: [`SiltError`] is the process-wide taxonomy surfaced to the
//! scheduler and watchdog, [`LoadError`] covers the target-side apply
//! protocol where duplicate-key violations need to be told apart from
//! genuine failures.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Top-level errors
#[derive(Error, Debug)]
pub enum SiltError {
    /// Malformed upstream record. Skipped with a warning; never fatal.
    #[error("transform error: {0}")]
    Transform(String),

    /// A merger observed an unrecoverable condition.
    #[error("merge error: {0}")]
    Merge(String),

    /// Target-side apply failure.
    #[error("load error: {0}")]
    Load(#[from] LoadError),

    /// Connection pool exhausted or all connections dropped.
    #[error("no target connection available")]
    NoConnection,

    /// Upstream consumer error.
    #[error("source error: {0}")]
    Source(String),

    /// Target table metadata could not be resolved.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Target database error outside the load protocol.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cooperative shutdown; drains cleanly, not an operator-facing error.
    #[error("stopped by watchdog")]
    WatchdogStop,
}

impl SiltError {
    /// Create a new transform error.
    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    /// Create a new merge error.
    pub fn merge(msg: impl Into<String>) -> Self {
        Self::Merge(msg.into())
    }

    /// Create a new source error.
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a new catalog error.
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a new config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Transform errors are skipped per record; everything else stops the
    /// pipeline that observed it.
    pub fn is_record_local(&self) -> bool {
        matches!(self, Self::Transform(_))
    }
}

/// Errors raised while applying one [`LoadTask`](crate::merge::LoadTask)
/// to the target.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Insert COPY hit an existing key. Triggers the pessimistic retry in
    /// optimistic mode, fatal otherwise.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// COPY protocol failure.
    #[error("copy failed: {0}")]
    Copy(#[source] tokio_postgres::Error),

    /// The in-process pipe between tuple producer and COPY driver broke.
    #[error("copy pipe failed: {0}")]
    Pipe(String),

    /// A statement of the delete-exists protocol failed.
    #[error("{context} failed: {source}")]
    Sql {
        context: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    /// Transaction commit failure.
    #[error("commit failed: {0}")]
    Commit(#[source] tokio_postgres::Error),
}

impl LoadError {
    /// Wrap a statement failure with its protocol step name.
    pub fn sql(context: &'static str, source: tokio_postgres::Error) -> Self {
        Self::Sql { context, source }
    }

    /// Check whether this error is a unique-constraint violation.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

/// Classify a COPY failure, separating duplicate-key violations from the
/// rest. SQLSTATE 23505 is authoritative; the message match covers drivers
/// that only surface the text.
pub(crate) fn classify_copy_error(e: tokio_postgres::Error) -> LoadError {
    if let Some(db) = e.as_db_error() {
        if db.code() == &SqlState::UNIQUE_VIOLATION
            || db.message().contains("duplicate key value")
        {
            return LoadError::DuplicateKey(db.message().to_string());
        }
    }
    LoadError::Copy(e)
}

/// Result type for replication operations
pub type Result<T, E = SiltError> = std::result::Result<T, E>;
