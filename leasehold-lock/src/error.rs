//! Lock error types.

use leasehold_store::StoreError;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Distributed lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock acquisition cancelled")]
    Cancelled,

    #[error("Lock timeout")]
    Timeout,

    #[error("Invalid lock name: {0}")]
    InvalidName(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// Check if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }

    /// Check if the store could not be reached.
    pub fn is_store_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Unavailable(_) | StoreError::Timeout)
        )
    }
}
