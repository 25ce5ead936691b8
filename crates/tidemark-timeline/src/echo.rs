//! UI echo reconciler.
//!
//! Tracks locally-originated, not-yet-synced activity so the UI can show
//! it optimistically: pending sends (most recent first), send-state
//! overrides keyed by event id, and pending reaction annotations keyed by
//! the target event id. All three tables live behind one mutex owned by
//! the reconciler; observing the synced copy of an event (matched by
//! transaction id) is the sole removal path besides explicit clearing.
//!
//! # Invariants
//!
//! - After `on_synced_event(t)`, no table entry referencing transaction
//!   `t` remains. Partial cleanup causes duplicate rendering.
//! - A send state already accepted by the server is never downgraded by
//!   an overlay.

use std::{collections::HashMap, sync::Mutex};

use tidemark_core::{ReactionAggregate, SendState, StoredEvent};
use tidemark_proto::{EventKind, RelationKind};

use crate::TimelineItem;

/// A pending local reaction targeting another event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReactionEcho {
    key: String,
    local_event_id: String,
    transaction_id: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    /// Pending locally-sent events, most recent first.
    pending_sends: Vec<StoredEvent>,
    /// Send-state overrides by (local) event id.
    send_states: HashMap<String, SendState>,
    /// Pending reaction annotations by target event id.
    reaction_echoes: HashMap<String, Vec<ReactionEcho>>,
}

/// Reconciles optimistic local echoes with their synced counterparts.
#[derive(Debug, Default)]
pub struct UiEchoReconciler {
    tables: Mutex<Tables>,
}

impl UiEchoReconciler {
    /// Create an empty reconciler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created local echo.
    ///
    /// Returns the target event id to rebuild when the echo is a reaction
    /// annotation (the aggregated view of the target changes immediately).
    #[allow(clippy::expect_used)]
    pub fn on_local_echo_created(&self, event: StoredEvent) -> Option<String> {
        let mut tables = self.tables.lock().expect("echo tables poisoned");

        let rebuild_target = if event.event.kind == EventKind::Reaction {
            event.event.relates_to().and_then(|relation| {
                (relation.kind == RelationKind::Annotation).then(|| {
                    let echo = ReactionEcho {
                        key: relation.key.unwrap_or_default(),
                        local_event_id: event.event.event_id.clone(),
                        transaction_id: event.event.transaction_id().map(ToOwned::to_owned),
                    };
                    tables
                        .reaction_echoes
                        .entry(relation.event_id.clone())
                        .or_default()
                        .push(echo);
                    relation.event_id
                })
            })
        } else {
            None
        };

        tables.send_states.insert(event.event.event_id.clone(), event.send_state);
        tables.pending_sends.insert(0, event);
        rebuild_target
    }

    /// Record a send-state transition for a local echo.
    ///
    /// Returns whether anything actually changed; callers skip the
    /// snapshot refresh when it did not.
    #[allow(clippy::expect_used)]
    pub fn on_send_state_updated(&self, event_id: &str, new_state: SendState) -> bool {
        let mut tables = self.tables.lock().expect("echo tables poisoned");
        if tables.send_states.get(event_id) == Some(&new_state) {
            return false;
        }
        tables.send_states.insert(event_id.to_owned(), new_state);
        for pending in &mut tables.pending_sends {
            if pending.event_id() == event_id {
                pending.send_state = new_state;
            }
        }
        true
    }

    /// Retire every echo matching a transaction id observed on a synced
    /// event. The sole removal path besides [`Self::clear`].
    #[allow(clippy::expect_used)]
    pub fn on_synced_event(&self, transaction_id: Option<&str>) {
        let Some(transaction_id) = transaction_id else { return };
        let mut tables = self.tables.lock().expect("echo tables poisoned");

        let retired: Vec<String> = tables
            .pending_sends
            .iter()
            .filter(|pending| pending.event.transaction_id() == Some(transaction_id))
            .map(|pending| pending.event_id().to_owned())
            .collect();

        tables
            .pending_sends
            .retain(|pending| pending.event.transaction_id() != Some(transaction_id));
        for event_id in &retired {
            tables.send_states.remove(event_id);
        }
        for echoes in tables.reaction_echoes.values_mut() {
            echoes.retain(|echo| echo.transaction_id.as_deref() != Some(transaction_id));
        }
        tables.reaction_echoes.retain(|_, echoes| !echoes.is_empty());
    }

    /// Overlay pending local reactions onto a synced event's aggregates.
    ///
    /// An echo whose reaction event already appears in the persisted
    /// summary is skipped; counting it again would double-render.
    #[allow(clippy::expect_used)]
    pub fn decorate_with_reaction_echo(&self, item: &mut TimelineItem) {
        let tables = self.tables.lock().expect("echo tables poisoned");
        let Some(echoes) = tables.reaction_echoes.get(&item.event_id) else { return };

        for echo in echoes {
            let already_counted = item
                .reactions
                .iter()
                .any(|agg| agg.source_event_ids.iter().any(|id| id == &echo.local_event_id));
            if already_counted {
                continue;
            }
            match item.reactions.iter_mut().find(|agg| agg.key == echo.key) {
                Some(aggregate) => {
                    aggregate.count += 1;
                    aggregate.added_by_me = true;
                    aggregate.source_event_ids.push(echo.local_event_id.clone());
                },
                None => item.reactions.push(ReactionAggregate {
                    key: echo.key.clone(),
                    count: 1,
                    added_by_me: true,
                    source_event_ids: vec![echo.local_event_id.clone()],
                }),
            }
        }
    }

    /// Overlay the most recent known send state onto an item.
    ///
    /// Already-sent events pass through unchanged.
    #[allow(clippy::expect_used)]
    pub fn update_sent_state(&self, item: &mut TimelineItem) {
        if item.send_state.is_sent() {
            return;
        }
        let tables = self.tables.lock().expect("echo tables poisoned");
        if let Some(state) = tables.send_states.get(&item.event_id) {
            item.send_state = *state;
        }
    }

    /// Pending send events, most recent first, with overlays applied.
    #[allow(clippy::expect_used)]
    pub fn pending_sends(&self) -> Vec<StoredEvent> {
        self.tables.lock().expect("echo tables poisoned").pending_sends.clone()
    }

    /// Drop every table entry.
    #[allow(clippy::expect_used)]
    pub fn clear(&self) {
        let mut tables = self.tables.lock().expect("echo tables poisoned");
        tables.pending_sends.clear();
        tables.send_states.clear();
        tables.reaction_echoes.clear();
    }

    /// Whether any table still references `transaction_id`. Test hook for
    /// the retirement invariant.
    #[allow(clippy::expect_used)]
    pub fn references_transaction(&self, transaction_id: &str) -> bool {
        let tables = self.tables.lock().expect("echo tables poisoned");
        let in_sends = tables
            .pending_sends
            .iter()
            .any(|pending| pending.event.transaction_id() == Some(transaction_id));
        let in_reactions = tables
            .reaction_echoes
            .values()
            .flatten()
            .any(|echo| echo.transaction_id.as_deref() == Some(transaction_id));
        in_sends || in_reactions
    }

    /// Whether a send-state override exists for `event_id`. Test hook.
    #[allow(clippy::expect_used)]
    pub fn has_send_state_override(&self, event_id: &str) -> bool {
        self.tables.lock().expect("echo tables poisoned").send_states.contains_key(event_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tidemark_proto::{Event, UnsignedData};

    use super::*;

    fn local_echo(local_id: &str, txn_id: &str) -> StoredEvent {
        let mut stored = StoredEvent::synced(
            "!room",
            Event {
                event_id: local_id.to_owned(),
                sender: "@me:example.org".to_owned(),
                kind: EventKind::Message,
                content: json!({"body": "optimistic"}),
                origin_server_ts: 0,
                state_key: None,
                unsigned: Some(UnsignedData {
                    transaction_id: Some(txn_id.to_owned()),
                    prev_content: None,
                }),
            },
            0,
        );
        stored.send_state = SendState::Sending;
        stored
    }

    fn local_reaction(local_id: &str, txn_id: &str, target: &str, key: &str) -> StoredEvent {
        let mut stored = local_echo(local_id, txn_id);
        stored.event.kind = EventKind::Reaction;
        stored.event.content = json!({
            "m.relates_to": {"rel_type": "m.annotation", "event_id": target, "key": key},
        });
        stored
    }

    fn item(event_id: &str) -> TimelineItem {
        TimelineItem {
            event_id: event_id.to_owned(),
            sender: "@alice:example.org".to_owned(),
            sender_display_name: None,
            sender_avatar_url: None,
            kind: EventKind::Message,
            content: json!({"body": "hi"}),
            timestamp_ms: 0,
            send_state: SendState::Synced,
            reactions: Vec::new(),
            decryption_error: None,
            awaiting_decryption: false,
            display_index: 0,
            transaction_id: None,
        }
    }

    #[test]
    fn synced_event_retires_all_tables() {
        let echoes = UiEchoReconciler::new();
        echoes.on_local_echo_created(local_echo("local-1", "txn-1"));
        echoes.on_local_echo_created(local_reaction("local-2", "txn-2", "$target", "👍"));
        assert!(echoes.references_transaction("txn-1"));
        assert!(echoes.references_transaction("txn-2"));

        echoes.on_synced_event(Some("txn-1"));
        assert!(!echoes.references_transaction("txn-1"));
        assert!(!echoes.has_send_state_override("local-1"));
        assert!(echoes.references_transaction("txn-2"));

        echoes.on_synced_event(Some("txn-2"));
        assert!(!echoes.references_transaction("txn-2"));
        assert!(echoes.pending_sends().is_empty());
    }

    #[test]
    fn send_state_update_reports_actual_changes_only() {
        let echoes = UiEchoReconciler::new();
        echoes.on_local_echo_created(local_echo("local-1", "txn-1"));

        assert!(echoes.on_send_state_updated("local-1", SendState::Sent));
        assert!(!echoes.on_send_state_updated("local-1", SendState::Sent));
        assert!(echoes.on_send_state_updated("local-1", SendState::Failed));
        assert_eq!(echoes.pending_sends()[0].send_state, SendState::Failed);
    }

    #[test]
    fn pending_sends_are_most_recent_first() {
        let echoes = UiEchoReconciler::new();
        echoes.on_local_echo_created(local_echo("local-1", "txn-1"));
        echoes.on_local_echo_created(local_echo("local-2", "txn-2"));

        let pending = echoes.pending_sends();
        assert_eq!(pending[0].event_id(), "local-2");
        assert_eq!(pending[1].event_id(), "local-1");
    }

    #[test]
    fn reaction_echo_increments_without_double_counting() {
        let echoes = UiEchoReconciler::new();
        let target =
            echoes.on_local_echo_created(local_reaction("local-r", "txn-r", "$target", "👍"));
        assert_eq!(target.as_deref(), Some("$target"));

        // Not yet in the persisted summary: overlay adds it.
        let mut fresh = item("$target");
        echoes.decorate_with_reaction_echo(&mut fresh);
        assert_eq!(fresh.reactions.len(), 1);
        assert_eq!(fresh.reactions[0].count, 1);
        assert!(fresh.reactions[0].added_by_me);

        // Already in the persisted summary: overlay must not double count.
        let mut synced = item("$target");
        synced.reactions.push(ReactionAggregate {
            key: "👍".to_owned(),
            count: 1,
            added_by_me: false,
            source_event_ids: vec!["local-r".to_owned()],
        });
        echoes.decorate_with_reaction_echo(&mut synced);
        assert_eq!(synced.reactions.len(), 1);
        assert_eq!(synced.reactions[0].count, 1);
    }

    #[test]
    fn sent_items_are_never_downgraded() {
        let echoes = UiEchoReconciler::new();
        echoes.on_local_echo_created(local_echo("local-1", "txn-1"));
        echoes.on_send_state_updated("local-1", SendState::Failed);

        let mut synced_item = item("local-1");
        synced_item.send_state = SendState::Synced;
        echoes.update_sent_state(&mut synced_item);
        assert_eq!(synced_item.send_state, SendState::Synced);

        let mut sending_item = item("local-1");
        sending_item.send_state = SendState::Sending;
        echoes.update_sent_state(&mut sending_item);
        assert_eq!(sending_item.send_state, SendState::Failed);
    }
}
