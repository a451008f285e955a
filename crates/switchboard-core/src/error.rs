//! Error taxonomy (spec §7) plus the storage-layer error kind (spec §4.A).

use thiserror::Error;

/// Errors raised by [`crate::store::StateStore`] implementations. The store
/// never retries internally; callers decide based on the kind.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("permanent storage error: {0}")]
    Permanent(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StorageError::Transient(e.to_string())
            }
            _ => StorageError::Permanent(e.to_string()),
        }
    }
}

/// Four-kind error taxonomy handlers surface to the executor (spec §7),
/// plus the two execution-path special cases.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("policy: {0}")]
    Policy(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("circuit open for route {route}, retry after {retry_after_ms}ms")]
    CircuitOpen { route: String, retry_after_ms: i64 },
    #[error("queue overflow")]
    Overflow,
    #[error("approval required: {id}")]
    ApprovalRequired { id: String },
}

impl ExecutionError {
    /// Whether this kind is eligible for the executor's transient-retry loop
    /// (spec §4.G.5 — only `TransientError`s are retried).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }

    /// Coerces any foreign error into `PermanentError`, truncating the
    /// message (spec §7 propagation rule).
    pub fn from_anyhow(e: anyhow::Error) -> Self {
        let mut msg = e.to_string();
        const MAX: usize = 500;
        if msg.len() > MAX {
            msg.truncate(MAX);
            msg.push_str("...");
        }
        ExecutionError::Permanent(msg)
    }
}

impl From<StorageError> for ExecutionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Transient(m) => ExecutionError::Transient(m),
            StorageError::Permanent(m) => ExecutionError::Permanent(m),
        }
    }
}
