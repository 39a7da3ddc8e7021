//! Bootstrap error types
//!
//! Every failure inside a bootstrap or refresh call surfaces as one of these.
//! Nothing here is retried; the orchestrator above decides whether to re-run.

use thiserror::Error;

/// Errors that can occur while building or refreshing a partition key index
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The partition key source terminated abnormally mid-scan
    #[error("Partition key source failed: {0}")]
    Source(String),

    /// The caller-supplied partition id resolver failed
    #[error("Partition id resolution failed: {0}")]
    Resolver(String),

    /// The index engine rejected an add/upsert/commit/refresh
    #[error("Index error: {0}")]
    Index(String),

    /// SQLite-backed adapter failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A spawned record task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The 32-bit partition id space is used up
    #[error("Partition id space exhausted after {allocated} allocations")]
    PartIdSpaceExhausted { allocated: u64 },

    /// Hour range with from > to
    #[error("Invalid hour range: from hour {from} is after to hour {to}")]
    InvalidHourRange { from: i64, to: i64 },

    /// Record violating end_time >= start_time, or undecodable key
    #[error("Invalid part key record: {0}")]
    InvalidRecord(String),

    /// Schema set definition error (duplicate or colliding schema ids)
    #[error("Schema error: {0}")]
    Schema(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

/// Result type alias for bootstrap operations
pub type BootstrapResult<T> = Result<T, BootstrapError>;
