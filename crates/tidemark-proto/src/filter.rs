//! Room event filter.
//!
//! Filtering is an explicit predicate over the closed [`EventKind`]
//! enumeration: enumerated boolean toggles evaluated directly, no content
//! inspection or type-string dispatch.

use serde::{Deserialize, Serialize};

use crate::{Event, EventKind, RelationKind};

/// Predicate deciding which events a timeline exposes to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEventFilter {
    /// Kinds to hide entirely. Empty means no kind-based filtering.
    #[serde(default)]
    pub hidden_kinds: Vec<EventKind>,
    /// Hide edit events (replacements are folded into their target).
    #[serde(default)]
    pub filter_edits: bool,
    /// Hide redaction events themselves.
    #[serde(default)]
    pub filter_redacted: bool,
    /// Hide events with no displayable content (empty message bodies,
    /// unrenderable state churn).
    #[serde(default)]
    pub filter_useless: bool,
}

impl RoomEventFilter {
    /// Whether `event` passes this filter.
    pub fn allows(&self, event: &Event) -> bool {
        if self.hidden_kinds.contains(&event.kind) {
            return false;
        }
        if self.filter_edits
            && event.relates_to().is_some_and(|rel| rel.kind == RelationKind::Replace)
        {
            return false;
        }
        if self.filter_redacted && event.kind == EventKind::Redaction {
            return false;
        }
        if self.filter_useless && self.is_useless(event) {
            return false;
        }
        true
    }

    fn is_useless(&self, event: &Event) -> bool {
        match event.kind {
            EventKind::Message => event
                .content
                .get("body")
                .and_then(|body| body.as_str())
                .is_none_or(str::is_empty),
            EventKind::Member => {
                // Pure profile churn (no membership transition) renders nothing.
                event.membership_content(false).is_some_and(|current| {
                    event
                        .membership_content(true)
                        .is_some_and(|previous| current.membership == previous.membership)
                })
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(body: &str) -> Event {
        Event {
            event_id: "$e1".to_owned(),
            sender: "@alice:example.org".to_owned(),
            kind: EventKind::Message,
            content: json!({"body": body}),
            origin_server_ts: 0,
            state_key: None,
            unsigned: None,
        }
    }

    #[test]
    fn default_filter_allows_everything() {
        let filter = RoomEventFilter::default();
        assert!(filter.allows(&message("hi")));
        assert!(filter.allows(&message("")));
    }

    #[test]
    fn hidden_kinds_are_rejected() {
        let filter =
            RoomEventFilter { hidden_kinds: vec![EventKind::Message], ..RoomEventFilter::default() };
        assert!(!filter.allows(&message("hi")));
    }

    #[test]
    fn useless_filter_drops_empty_bodies() {
        let filter = RoomEventFilter { filter_useless: true, ..RoomEventFilter::default() };
        assert!(filter.allows(&message("hi")));
        assert!(!filter.allows(&message("")));
    }

    #[test]
    fn edit_filter_drops_replacements() {
        let filter = RoomEventFilter { filter_edits: true, ..RoomEventFilter::default() };
        let mut edit = message("v2");
        edit.content = json!({
            "body": "v2",
            "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"},
        });
        assert!(!filter.allows(&edit));
        assert!(filter.allows(&message("plain")));
    }
}
