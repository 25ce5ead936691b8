//! Store error type.
//!
//! Persistence failures abort the surrounding operation atomically and are
//! surfaced to the caller, which treats them as retryable fetch failures.

use thiserror::Error;

use crate::ChunkId;

/// Errors from the persistence substrate or the logic built on it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A chunk id did not resolve to a live chunk record.
    #[error("chunk {0} not found")]
    ChunkNotFound(ChunkId),

    /// An event id did not resolve to a stored event.
    #[error("event '{0}' not found")]
    EventNotFound(String),

    /// The room has no record in the store.
    #[error("room '{0}' not found")]
    RoomNotFound(String),

    /// The underlying substrate rejected a transaction.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

impl StoreError {
    /// Whether a caller-initiated retry may succeed.
    ///
    /// Transaction failures are transient substrate conditions; missing
    /// records are logic errors that a retry will not fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransactionFailed(_))
    }
}
