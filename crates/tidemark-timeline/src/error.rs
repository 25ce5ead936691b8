//! Timeline error taxonomy.
//!
//! Transient network failures leave the pagination state retryable;
//! terminal-for-mode failures (an unresolvable permalink) make the façade
//! fall back to live mode; store failures propagate as retryable fetch
//! failures. Nothing in this crate panics in non-test code.

use thiserror::Error;
use tidemark_core::StoreError;

/// Errors surfaced through the timeline's listener channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineError {
    /// An operation was issued before `start` (or after `dispose`).
    #[error("timeline is not started")]
    NotStarted,

    /// A pagination fetch failed with a transient network error.
    /// The pagination state is reset so the caller may retry.
    #[error("pagination failed: {0}")]
    Network(String),

    /// The permalink anchor could not be resolved (not found or
    /// forbidden). Terminal for permalink mode; the timeline falls back
    /// to live mode.
    #[error("permalink event '{event_id}' could not be resolved: {reason}")]
    PermalinkUnresolved {
        /// The event id the timeline was anchored on.
        event_id: String,
        /// Remote reason for the failure.
        reason: String,
    },

    /// The persistence substrate rejected an operation.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl TimelineError {
    /// Whether a caller-initiated retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Store(err) => err.is_transient(),
            Self::NotStarted | Self::PermalinkUnresolved { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(TimelineError::Network("timeout".into()).is_retryable());
        assert!(!TimelineError::NotStarted.is_retryable());
        assert!(
            !TimelineError::PermalinkUnresolved {
                event_id: "$gone".into(),
                reason: "not found".into()
            }
            .is_retryable()
        );
    }
}
