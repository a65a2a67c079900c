//! Store error types.

use crate::store::{LeaseId, Revision};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or is electing a leader.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Timeout error.
    #[error("Store request timed out")]
    Timeout,

    /// The lease is unknown to the store, either expired or revoked.
    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    /// The requested watch revision is no longer in the store's history.
    #[error("Revision {0} has been compacted")]
    Compacted(Revision),

    /// The store rejected the request with a status code.
    #[error("Store returned status {code}: {message}")]
    Status {
        /// gRPC status code reported by the store.
        code: i32,
        /// Message reported by the store.
        message: String,
    },

    /// The store answered with something we could not interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Check if this error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }

    /// Check if this error reports a missing lease.
    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, Self::LeaseNotFound(_))
    }
}
