//! Remote pagination API boundary.
//!
//! The engine consumes exactly two remote operations: a token-based page
//! fetch and an event-centered context fetch. Both return the same
//! [`Page`] shape. Implementations live outside this crate (HTTP client,
//! test fakes); the engine only sees this trait.

use async_trait::async_trait;
use thiserror::Error;
use tidemark_proto::{Direction, Page, RoomEventFilter};

/// Failures from the remote pagination API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Transport-level failure. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The requested event does not exist on the server.
    #[error("event not found")]
    NotFound,

    /// The server refused access to the requested history.
    #[error("access forbidden")]
    Forbidden,
}

impl ApiError {
    /// Whether a retry of the same request may succeed.
    ///
    /// Semantic failures (not found, forbidden) are terminal for the
    /// operation that triggered them and require a mode change instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Remote pagination operations consumed by the chunk tree and façade.
#[async_trait]
pub trait PaginationApi: Send + Sync + 'static {
    /// Fetch up to `limit` events walking `direction` from `from`.
    async fn messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: u32,
        filter: &RoomEventFilter,
    ) -> Result<Page, ApiError>;

    /// Fetch the events surrounding `event_id`.
    ///
    /// The returned page is centered on the event rather than a token:
    /// `events` holds the window oldest-first including the anchor,
    /// `start`/`end` are the backward/forward continuation tokens.
    async fn context_of_event(
        &self,
        room_id: &str,
        event_id: &str,
        limit: u32,
        filter: &RoomEventFilter,
    ) -> Result<Page, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_failures_are_not_retryable() {
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(!ApiError::NotFound.is_retryable());
        assert!(!ApiError::Forbidden.is_retryable());
    }
}
