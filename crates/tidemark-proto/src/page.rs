//! Pagination page.
//!
//! A [`Page`] is one response from the remote pagination API: a token on
//! each edge plus the ordered events and state events in between. The same
//! shape is returned by both the token-based `/messages` fetch and the
//! event-centered context fetch.

use serde::{Deserialize, Serialize};

use crate::Event;

/// One page of room history delivered by the remote API.
///
/// `start` is the token at the edge the request was made from; `end` is the
/// continuation token toward the requested direction. Servers signal the
/// edge of history by omitting `end` or echoing `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Token at the request edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Continuation token toward the requested direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Timeline events in page order.
    #[serde(default, rename = "chunk")]
    pub events: Vec<Event>,
    /// State events needed to interpret the timeline events.
    #[serde(default, rename = "state")]
    pub state_events: Vec<Event>,
}

impl Page {
    /// Whether the server indicated more history exists past this page.
    ///
    /// A missing continuation token, or one equal to the start token, means
    /// the edge of history was reached.
    pub fn has_more(&self) -> bool {
        match &self.end {
            None => false,
            Some(end) => Some(end) != self.start.as_ref(),
        }
    }

    /// Ids of all well-formed timeline events in this page.
    pub fn event_ids(&self) -> Vec<String> {
        self.events
            .iter()
            .filter(|event| !event.event_id.is_empty())
            .map(|event| event.event_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_more_requires_a_fresh_continuation_token() {
        let mut page = Page { start: Some("a".into()), end: Some("b".into()), ..Page::default() };
        assert!(page.has_more());

        page.end = None;
        assert!(!page.has_more());

        page.end = Some("a".into());
        assert!(!page.has_more());
    }
}
