//! Room event envelope.
//!
//! An [`Event`] is the immutable envelope delivered by the remote API:
//! identity, sender, kind, JSON content, and server timestamp. Mutable
//! decorations (decryption results, send state, display index) live on the
//! persisted record in `tidemark-core`, never here.
//!
//! Event kinds are a closed enumeration rather than free-form type strings;
//! filtering and formatting match on the variant directly. Unrecognized
//! wire types survive round-trips through [`EventKind::Other`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Validation errors for incoming events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A required envelope field was empty or absent.
    #[error("event is missing required field '{0}'")]
    MissingField(&'static str),
}

/// Closed enumeration of event kinds the engine distinguishes.
///
/// The wire carries free-form type strings; everything the engine does not
/// dispatch on collapses into [`EventKind::Other`], which filters treat as
/// filterable-by-type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Plain room message.
    Message,
    /// Encrypted payload awaiting decryption.
    Encrypted,
    /// Room membership state event.
    Member,
    /// Reaction annotation targeting another event.
    Reaction,
    /// Redaction of another event.
    Redaction,
    /// Room creation state event.
    Create,
    /// Any other wire type, preserved verbatim.
    Other(String),
}

impl EventKind {
    const MESSAGE: &'static str = "m.room.message";
    const ENCRYPTED: &'static str = "m.room.encrypted";
    const MEMBER: &'static str = "m.room.member";
    const REACTION: &'static str = "m.reaction";
    const REDACTION: &'static str = "m.room.redaction";
    const CREATE: &'static str = "m.room.create";

    /// Wire type string for this kind.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Message => Self::MESSAGE,
            Self::Encrypted => Self::ENCRYPTED,
            Self::Member => Self::MEMBER,
            Self::Reaction => Self::REACTION,
            Self::Redaction => Self::REDACTION,
            Self::Create => Self::CREATE,
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for EventKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            Self::MESSAGE => Self::Message,
            Self::ENCRYPTED => Self::Encrypted,
            Self::MEMBER => Self::Member,
            Self::REACTION => Self::Reaction,
            Self::REDACTION => Self::Redaction,
            Self::CREATE => Self::Create,
            _ => Self::Other(raw),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_wire().to_owned()
    }
}

/// How an event relates to another event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationKind {
    /// Thread relation: the target is the thread root.
    Thread,
    /// Reaction annotation; `key` carries the reaction.
    Annotation,
    /// Edit of the target event.
    Replace,
    /// Any other relation type, preserved verbatim.
    Other(String),
}

impl RelationKind {
    const THREAD: &'static str = "m.thread";
    const ANNOTATION: &'static str = "m.annotation";
    const REPLACE: &'static str = "m.replace";
}

impl From<String> for RelationKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            Self::THREAD => Self::Thread,
            Self::ANNOTATION => Self::Annotation,
            Self::REPLACE => Self::Replace,
            _ => Self::Other(raw),
        }
    }
}

impl From<RelationKind> for String {
    fn from(kind: RelationKind) -> Self {
        match kind {
            RelationKind::Thread => RelationKind::THREAD.to_owned(),
            RelationKind::Annotation => RelationKind::ANNOTATION.to_owned(),
            RelationKind::Replace => RelationKind::REPLACE.to_owned(),
            RelationKind::Other(raw) => raw,
        }
    }
}

/// Parsed `m.relates_to` content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Relation type.
    #[serde(rename = "rel_type")]
    pub kind: RelationKind,
    /// Target event id.
    pub event_id: String,
    /// Annotation key (reaction emoji) when [`RelationKind::Annotation`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Encryption metadata carried by an encrypted event's content.
///
/// The decryption queue keys its per-session blocked sets on `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    /// Encryption algorithm identifier.
    pub algorithm: String,
    /// Id of the session the payload was encrypted with.
    pub session_id: String,
    /// Curve key of the sending device, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
}

/// Membership state content, used to resolve sender display metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipContent {
    /// Membership value (`join`, `leave`, ...).
    #[serde(default)]
    pub membership: String,
    /// Display name chosen by the member.
    #[serde(default, rename = "displayname", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL chosen by the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Server-attached metadata that is not part of the signed envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedData {
    /// Transaction id echoed back for locally-originated events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Previous state content, used when applying backward pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<Value>,
}

/// Immutable room event envelope as delivered by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id (unique within a room once synced).
    pub event_id: String,
    /// Sender user id.
    pub sender: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// JSON content; ciphertext envelope for encrypted events.
    #[serde(default)]
    pub content: Value,
    /// Server timestamp in milliseconds. Not strictly ordered across
    /// federation; never used as an ordering key.
    #[serde(default)]
    pub origin_server_ts: u64,
    /// State key; present exactly for state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Server-attached unsigned metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<UnsignedData>,
}

impl Event {
    /// Validate the required envelope fields.
    ///
    /// The merge persistor drops events failing this check without aborting
    /// the surrounding transaction.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_id.is_empty() {
            return Err(EventError::MissingField("event_id"));
        }
        if self.sender.is_empty() {
            return Err(EventError::MissingField("sender"));
        }
        Ok(())
    }

    /// Whether this is a state event.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Whether this event carries an encrypted payload.
    pub fn is_encrypted(&self) -> bool {
        self.kind == EventKind::Encrypted
    }

    /// Transaction id, present when this event originated locally.
    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned.as_ref()?.transaction_id.as_deref()
    }

    /// Encryption metadata parsed from the content.
    ///
    /// `None` for unencrypted events or malformed ciphertext envelopes.
    pub fn encryption_info(&self) -> Option<EncryptionInfo> {
        if !self.is_encrypted() {
            return None;
        }
        serde_json::from_value(self.content.clone()).ok()
    }

    /// Relation parsed from the content's `m.relates_to`, if any.
    pub fn relates_to(&self) -> Option<Relation> {
        let relates = self.content.get("m.relates_to")?;
        serde_json::from_value(relates.clone()).ok()
    }

    /// Thread root event id, when this event belongs to a thread.
    pub fn thread_root(&self) -> Option<String> {
        let relation = self.relates_to()?;
        (relation.kind == RelationKind::Thread).then_some(relation.event_id)
    }

    /// Membership content, when this is a member state event.
    ///
    /// `use_prev` selects `unsigned.prev_content` over `content`, which is
    /// what backward page application needs.
    pub fn membership_content(&self, use_prev: bool) -> Option<MembershipContent> {
        if self.kind != EventKind::Member {
            return None;
        }
        let source = if use_prev {
            self.unsigned.as_ref()?.prev_content.as_ref()?
        } else {
            &self.content
        };
        serde_json::from_value(source.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(kind: &str, content: Value) -> Event {
        Event {
            event_id: "$e1".to_owned(),
            sender: "@alice:example.org".to_owned(),
            kind: EventKind::from(kind.to_owned()),
            content,
            origin_server_ts: 1_700_000_000_000,
            state_key: None,
            unsigned: None,
        }
    }

    #[test]
    fn kind_round_trips_known_and_unknown_types() {
        for raw in ["m.room.message", "m.room.encrypted", "m.reaction", "com.example.custom"] {
            let kind = EventKind::from(raw.to_owned());
            assert_eq!(kind.as_wire(), raw);
        }
        assert_eq!(EventKind::from("m.room.member".to_owned()), EventKind::Member);
    }

    #[test]
    fn validate_rejects_empty_required_fields() {
        let mut ev = event("m.room.message", json!({"body": "hi"}));
        assert_eq!(ev.validate(), Ok(()));

        ev.event_id = String::new();
        assert_eq!(ev.validate(), Err(EventError::MissingField("event_id")));

        ev.event_id = "$e1".to_owned();
        ev.sender = String::new();
        assert_eq!(ev.validate(), Err(EventError::MissingField("sender")));
    }

    #[test]
    fn encryption_info_parses_ciphertext_envelope() {
        let ev = event(
            "m.room.encrypted",
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "session_id": "sess-1",
                "sender_key": "curve-key",
                "ciphertext": "opaque",
            }),
        );
        let info = ev.encryption_info().expect("should parse");
        assert_eq!(info.session_id, "sess-1");
        assert_eq!(info.algorithm, "m.megolm.v1.aes-sha2");
        assert_eq!(info.sender_key.as_deref(), Some("curve-key"));

        let plain = event("m.room.message", json!({"body": "hi"}));
        assert!(plain.encryption_info().is_none());
    }

    #[test]
    fn thread_root_only_for_thread_relations() {
        let threaded = event(
            "m.room.message",
            json!({
                "body": "reply",
                "m.relates_to": {"rel_type": "m.thread", "event_id": "$root"},
            }),
        );
        assert_eq!(threaded.thread_root().as_deref(), Some("$root"));

        let reaction = event(
            "m.reaction",
            json!({
                "m.relates_to": {"rel_type": "m.annotation", "event_id": "$target", "key": "👍"},
            }),
        );
        assert_eq!(reaction.thread_root(), None);
        let relation = reaction.relates_to().expect("should parse");
        assert_eq!(relation.kind, RelationKind::Annotation);
        assert_eq!(relation.key.as_deref(), Some("👍"));
    }

    #[test]
    fn membership_content_prefers_prev_content_when_asked() {
        let mut ev = event(
            "m.room.member",
            json!({"membership": "join", "displayname": "Alice"}),
        );
        ev.state_key = Some("@alice:example.org".to_owned());
        ev.unsigned = Some(UnsignedData {
            transaction_id: None,
            prev_content: Some(json!({"membership": "join", "displayname": "Old Alice"})),
        });

        let current = ev.membership_content(false).expect("current content");
        assert_eq!(current.display_name.as_deref(), Some("Alice"));

        let previous = ev.membership_content(true).expect("prev content");
        assert_eq!(previous.display_name.as_deref(), Some("Old Alice"));
    }

    #[test]
    fn envelope_deserializes_from_wire_json() {
        let raw = json!({
            "event_id": "$e9",
            "sender": "@bob:example.org",
            "type": "m.room.message",
            "content": {"body": "hello"},
            "origin_server_ts": 1_700_000_000_123u64,
            "unsigned": {"transaction_id": "txn-4"},
        });
        let ev: Event = serde_json::from_value(raw).expect("should deserialize");
        assert_eq!(ev.kind, EventKind::Message);
        assert_eq!(ev.transaction_id(), Some("txn-4"));
    }
}
