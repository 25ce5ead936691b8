//! Stored events and their mutable decorations.
//!
//! The envelope ([`tidemark_proto::Event`]) is immutable once persisted.
//! Everything else on a [`StoredEvent`] is decoration the engine maintains:
//! the display index used as the chunk-local cursor, the send state of
//! locally-originated events, decryption results and errors, the resolved
//! sender profile, and the aggregated reaction summary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidemark_proto::Event;

/// Send lifecycle of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendState {
    /// Locally created, not yet accepted by the server.
    Sending,
    /// Accepted by the server; not yet observed through sync.
    Sent,
    /// Observed through sync; the authoritative copy.
    Synced,
    /// The send failed; a retry may be issued.
    Failed,
}

impl SendState {
    /// Whether the server has accepted the event.
    ///
    /// Sent states are never downgraded by UI echo overlays.
    pub fn is_sent(self) -> bool {
        matches!(self, Self::Sent | Self::Synced)
    }
}

/// Outcome of a successful decryption, persisted on the event.
///
/// Applied atomically: an event carries either a full result or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionResult {
    /// Decrypted clear payload.
    pub payload: Value,
    /// Session the payload was decrypted with, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Classified decryption failure, persisted on the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecryptionErrorCode {
    /// The session needed to decrypt is not yet known. Retried
    /// automatically once the session's keys are imported.
    UnknownSession,
    /// The session is known but the message index is out of range.
    UnknownMessageIndex,
    /// Any other cryptographic failure. Recorded, never retried.
    Other,
}

/// Sender display metadata resolved from room-member state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    /// Display name at the time the event was inserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL at the time the event was inserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// One reaction key aggregated over a target event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionAggregate {
    /// Reaction key (usually an emoji).
    pub key: String,
    /// Number of distinct reaction events with this key.
    pub count: u64,
    /// Whether the local user contributed one of them.
    pub added_by_me: bool,
    /// Ids of the reaction events folded into this aggregate.
    pub source_event_ids: Vec<String>,
}

/// Persisted room event: immutable envelope plus mutable decorations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Room the event belongs to.
    pub room_id: String,
    /// Immutable envelope.
    pub event: Event,
    /// Chunk-local ordering key; strictly increasing along the forward
    /// direction. Not related to wall-clock timestamps.
    pub display_index: i64,
    /// Send lifecycle.
    pub send_state: SendState,
    /// Decryption result, when decryption has succeeded.
    pub decryption: Option<DecryptionResult>,
    /// Last decryption failure, when decryption has failed.
    pub decryption_error: Option<(DecryptionErrorCode, String)>,
    /// Sender profile captured at insert time.
    pub sender_profile: Option<SenderProfile>,
    /// Thread root this event belongs to, when known.
    pub thread_root: Option<String>,
    /// Aggregated reactions targeting this event.
    pub reactions: Vec<ReactionAggregate>,
}

impl StoredEvent {
    /// Wrap a synced envelope with default decorations.
    pub fn synced(room_id: impl Into<String>, event: Event, display_index: i64) -> Self {
        Self {
            room_id: room_id.into(),
            event,
            display_index,
            send_state: SendState::Synced,
            decryption: None,
            decryption_error: None,
            sender_profile: None,
            thread_root: None,
            reactions: Vec::new(),
        }
    }

    /// Event id of the envelope.
    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    /// Whether the event still needs decryption.
    pub fn needs_decryption(&self) -> bool {
        self.event.is_encrypted() && self.decryption.is_none()
    }
}
