// Error taxonomy shared by every Montage subsystem.
// Retryable variants (transient, conflict, contention) are distinguished
// from permanent ones so callers can pick the right recovery path.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store unavailable, network timeout, or any failure worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// Optimistic-concurrency failure. Reread the aggregate and retry.
    #[error("version conflict on `{project_id}`: expected {expected}, found {actual}")]
    VersionConflict {
        project_id: String,
        expected: u64,
        actual: u64,
    },

    /// Lock is currently held by another owner.
    #[error("lock `{0}` is held elsewhere")]
    LockUnavailable(String),

    /// A mutation that requires a named lock was attempted without holding it.
    #[error("lock `{key}` required but not held by `{owner}`")]
    LockRequired { key: String, owner: String },

    /// Schema violation or invalid state transition. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_)
                | CoreError::VersionConflict { .. }
                | CoreError::LockUnavailable(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
