//! UI-ready timeline items.
//!
//! A [`TimelineItem`] is the immutable view of one event as exposed in
//! snapshots: envelope fields plus every decoration resolved at build time
//! (decrypted content, sender profile, send state, reactions). Snapshots
//! clone freely; nothing here is shared mutable state.

use serde_json::Value;
use tidemark_core::{DecryptionErrorCode, ReactionAggregate, SendState, StoredEvent};
use tidemark_proto::EventKind;

/// One event as exposed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineItem {
    /// Event id (a local id until the event is server-confirmed).
    pub event_id: String,
    /// Sender user id.
    pub sender: String,
    /// Sender display name, when resolved.
    pub sender_display_name: Option<String>,
    /// Sender avatar URL, when resolved.
    pub sender_avatar_url: Option<String>,
    /// Event kind; for decrypted events, the kind of the clear payload.
    pub kind: EventKind,
    /// Displayable content; for decrypted events, the clear content.
    pub content: Value,
    /// Server timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Send lifecycle (UI echo overlays may adjust this).
    pub send_state: SendState,
    /// Aggregated reactions, including local echo overlays.
    pub reactions: Vec<ReactionAggregate>,
    /// Decryption failure recorded for this event, if any.
    pub decryption_error: Option<(DecryptionErrorCode, String)>,
    /// Whether the payload is encrypted and not yet decrypted.
    pub awaiting_decryption: bool,
    /// Chunk-local ordering key.
    pub display_index: i64,
    /// Transaction id for locally-originated events.
    pub transaction_id: Option<String>,
}

impl TimelineItem {
    /// Build an item from a stored event.
    ///
    /// A decrypted payload replaces the ciphertext envelope's kind and
    /// content; everything else comes straight from the record.
    pub fn from_stored(stored: &StoredEvent) -> Self {
        let (kind, content) = match &stored.decryption {
            Some(result) => {
                let kind = result
                    .payload
                    .get("type")
                    .and_then(Value::as_str)
                    .map_or_else(|| stored.event.kind.clone(), |raw| EventKind::from(raw.to_owned()));
                let content = result.payload.get("content").cloned().unwrap_or(Value::Null);
                (kind, content)
            },
            None => (stored.event.kind.clone(), stored.event.content.clone()),
        };

        Self {
            event_id: stored.event.event_id.clone(),
            sender: stored.event.sender.clone(),
            sender_display_name: stored
                .sender_profile
                .as_ref()
                .and_then(|profile| profile.display_name.clone()),
            sender_avatar_url: stored
                .sender_profile
                .as_ref()
                .and_then(|profile| profile.avatar_url.clone()),
            kind,
            content,
            timestamp_ms: stored.event.origin_server_ts,
            send_state: stored.send_state,
            reactions: stored.reactions.clone(),
            decryption_error: stored.decryption_error.clone(),
            awaiting_decryption: stored.needs_decryption(),
            display_index: stored.display_index,
            transaction_id: stored.event.transaction_id().map(ToOwned::to_owned),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tidemark_core::DecryptionResult;
    use tidemark_proto::Event;

    use super::*;

    fn encrypted_stored() -> StoredEvent {
        StoredEvent::synced(
            "!room",
            Event {
                event_id: "$enc".to_owned(),
                sender: "@alice:example.org".to_owned(),
                kind: EventKind::Encrypted,
                content: json!({"algorithm": "m.megolm.v1.aes-sha2", "session_id": "s1"}),
                origin_server_ts: 1_700_000_000_000,
                state_key: None,
                unsigned: None,
            },
            3,
        )
    }

    #[test]
    fn undecrypted_event_keeps_ciphertext_envelope() {
        let item = TimelineItem::from_stored(&encrypted_stored());
        assert_eq!(item.kind, EventKind::Encrypted);
        assert!(item.awaiting_decryption);
    }

    #[test]
    fn decrypted_event_exposes_clear_payload() {
        let mut stored = encrypted_stored();
        stored.decryption = Some(DecryptionResult {
            payload: json!({
                "type": "m.room.message",
                "content": {"body": "the clear text"},
            }),
            session_id: Some("s1".to_owned()),
        });

        let item = TimelineItem::from_stored(&stored);
        assert_eq!(item.kind, EventKind::Message);
        assert_eq!(item.content, json!({"body": "the clear text"}));
        assert!(!item.awaiting_decryption);
    }
}
