//! In-memory store implementation for tests and simulation.
//!
//! Uses `HashMap` arenas per room behind an `Arc<Mutex<_>>` so clones share
//! state. Transactions are copy-on-write: the room's data is cloned, the
//! closure mutates the clone, and the clone replaces the original only on
//! `Ok`, which gives the all-or-nothing semantics the merge persistor
//! relies on. Change notifications queue during the transaction and are
//! published after commit, never before.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tidemark_proto::{Direction, MembershipContent};
use tokio::sync::broadcast;

use super::{StoreChange, StoreTxn, TimelineStore};
use crate::{
    ChunkId, ChunkRecord, DecryptionErrorCode, DecryptionResult, SendState, StoreError,
    StoredEvent,
};

/// Capacity of the change-notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
struct RoomData {
    chunks: HashMap<ChunkId, ChunkRecord>,
    events: HashMap<String, StoredEvent>,
    members: HashMap<String, MembershipContent>,
    latest_previewable: Option<String>,
    sending: Vec<StoredEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    rooms: HashMap<String, RoomData>,
}

/// In-memory [`TimelineStore`].
///
/// # Panics
///
/// Methods panic if the internal mutex is poisoned (a thread panicked while
/// holding the lock). Acceptable for test/simulation code; a production
/// substrate would map poisoning to [`StoreError::TransactionFailed`].
#[derive(Clone)]
pub struct MemoryTimelineStore {
    inner: Arc<Mutex<Inner>>,
    next_chunk_id: Arc<AtomicU64>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryTimelineStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_chunk_id: Arc::new(AtomicU64::new(1)),
            changes,
        }
    }

    /// Number of live chunks in a room. Useful for invariant assertions.
    #[allow(clippy::expect_used)]
    pub fn chunk_count(&self, room_id: &str) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.rooms.get(room_id).map_or(0, |room| room.chunks.len())
    }

    /// All chunk records of a room, in unspecified order.
    #[allow(clippy::expect_used)]
    pub fn all_chunks(&self, room_id: &str) -> Vec<ChunkRecord> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.rooms.get(room_id).map_or_else(Vec::new, |room| {
            room.chunks.values().cloned().collect()
        })
    }

    #[allow(clippy::expect_used)]
    fn read<T>(&self, room_id: &str, f: impl FnOnce(&RoomData) -> T) -> Result<T, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let Some(room) = inner.rooms.get(room_id) else {
            return Err(StoreError::RoomNotFound(room_id.to_owned()));
        };
        Ok(f(room))
    }

    /// Read access that treats a missing room as empty.
    #[allow(clippy::expect_used)]
    fn read_or_default<T>(&self, room_id: &str, f: impl FnOnce(&RoomData) -> T) -> T {
        let inner = self.inner.lock().expect("Mutex poisoned");
        match inner.rooms.get(room_id) {
            Some(room) => f(room),
            None => f(&RoomData::default()),
        }
    }

    fn update_event(
        &self,
        room_id: &str,
        event_id: &str,
        f: impl FnOnce(&mut StoredEvent),
    ) -> Result<(), StoreError> {
        self.in_transaction(room_id, |txn| {
            let mut stored = txn
                .event(event_id)
                .ok_or_else(|| StoreError::EventNotFound(event_id.to_owned()))?;
            f(&mut stored);
            txn.put_event(stored);
            txn.emit(StoreChange::EventUpdated {
                room_id: room_id.to_owned(),
                event_id: event_id.to_owned(),
            });
            Ok(())
        })
    }
}

impl Default for MemoryTimelineStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTxn<'a> {
    room_id: &'a str,
    data: &'a mut RoomData,
    next_chunk_id: &'a AtomicU64,
    pending: Vec<StoreChange>,
}

impl StoreTxn for MemoryTxn<'_> {
    fn chunk(&self, id: ChunkId) -> Option<ChunkRecord> {
        self.data.chunks.get(&id).cloned()
    }

    fn find_chunk_by_next_token(&self, token: &str) -> Option<ChunkRecord> {
        self.data.chunks.values().find(|c| c.next_token.as_deref() == Some(token)).cloned()
    }

    fn find_chunk_by_prev_token(&self, token: &str) -> Option<ChunkRecord> {
        self.data.chunks.values().find(|c| c.prev_token.as_deref() == Some(token)).cloned()
    }

    fn live_chunk(&self) -> Option<ChunkRecord> {
        self.data
            .chunks
            .values()
            .find(|c| c.is_last_forward && c.root_thread_event_id.is_none())
            .cloned()
    }

    fn thread_chunk(&self, root_event_id: &str) -> Option<ChunkRecord> {
        self.data
            .chunks
            .values()
            .find(|c| c.root_thread_event_id.as_deref() == Some(root_event_id))
            .cloned()
    }

    fn chunks_containing(&self, event_ids: &[String]) -> Vec<ChunkRecord> {
        let mut found: Vec<ChunkRecord> = self
            .data
            .chunks
            .values()
            .filter(|chunk| event_ids.iter().any(|id| chunk.contains(id)))
            .cloned()
            .collect();
        // Deterministic order for merge processing.
        found.sort_by_key(|chunk| chunk.id);
        found
    }

    fn all_chunks(&self) -> Vec<ChunkRecord> {
        let mut chunks: Vec<ChunkRecord> = self.data.chunks.values().cloned().collect();
        chunks.sort_by_key(|chunk| chunk.id);
        chunks
    }

    fn event(&self, event_id: &str) -> Option<StoredEvent> {
        self.data.events.get(event_id).cloned()
    }

    fn member_content(&self, user_id: &str) -> Option<MembershipContent> {
        self.data.members.get(user_id).cloned()
    }

    fn display_bounds(&self, chunk_id: ChunkId) -> Option<(i64, i64)> {
        let chunk = self.data.chunks.get(&chunk_id)?;
        let mut bounds: Option<(i64, i64)> = None;
        for id in &chunk.event_ids {
            let Some(event) = self.data.events.get(id) else { continue };
            let index = event.display_index;
            bounds = Some(match bounds {
                None => (index, index),
                Some((min, max)) => (min.min(index), max.max(index)),
            });
        }
        bounds
    }

    fn create_chunk(&mut self) -> ChunkRecord {
        let id = ChunkId(self.next_chunk_id.fetch_add(1, Ordering::Relaxed));
        let chunk = ChunkRecord::new(id, self.room_id);
        self.data.chunks.insert(id, chunk.clone());
        chunk
    }

    fn put_chunk(&mut self, chunk: ChunkRecord) {
        self.data.chunks.insert(chunk.id, chunk);
    }

    fn delete_chunk(&mut self, id: ChunkId) {
        let Some(removed) = self.data.chunks.remove(&id) else { return };

        for event_id in &removed.event_ids {
            let shared = self.data.chunks.values().any(|other| other.contains(event_id));
            let is_state = self
                .data
                .events
                .get(event_id)
                .is_some_and(|stored| stored.event.is_state());
            if !shared && !is_state {
                self.data.events.remove(event_id);
            }
        }

        for chunk in self.data.chunks.values_mut() {
            if chunk.prev_chunk == Some(id) {
                chunk.prev_chunk = None;
            }
            if chunk.next_chunk == Some(id) {
                chunk.next_chunk = None;
            }
        }

        self.pending.push(StoreChange::ChunkDeleted {
            room_id: self.room_id.to_owned(),
            chunk_id: id,
        });
    }

    fn put_event(&mut self, event: StoredEvent) {
        self.data.events.insert(event.event_id().to_owned(), event);
    }

    fn set_member_content(&mut self, user_id: &str, content: MembershipContent) {
        self.data.members.insert(user_id.to_owned(), content);
    }

    fn set_latest_previewable(&mut self, event_id: Option<String>) {
        self.data.latest_previewable = event_id;
    }

    fn emit(&mut self, change: StoreChange) {
        self.pending.push(change);
    }
}

impl TimelineStore for MemoryTimelineStore {
    #[allow(clippy::expect_used)]
    fn in_transaction<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut dyn StoreTxn) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        let mut staged = inner.rooms.get(room_id).cloned().unwrap_or_default();

        let mut txn = MemoryTxn {
            room_id,
            data: &mut staged,
            next_chunk_id: &self.next_chunk_id,
            pending: Vec::new(),
        };
        let outcome = f(&mut txn);
        let pending = txn.pending;

        match outcome {
            Ok(value) => {
                inner.rooms.insert(room_id.to_owned(), staged);
                drop(inner);
                for change in pending {
                    let _ = self.changes.send(change);
                }
                Ok(value)
            },
            Err(err) => Err(err),
        }
    }

    fn chunk(&self, room_id: &str, id: ChunkId) -> Result<Option<ChunkRecord>, StoreError> {
        Ok(self.read_or_default(room_id, |room| room.chunks.get(&id).cloned()))
    }

    fn live_chunk(&self, room_id: &str) -> Result<Option<ChunkRecord>, StoreError> {
        Ok(self.read_or_default(room_id, |room| {
            room.chunks
                .values()
                .find(|c| c.is_last_forward && c.root_thread_event_id.is_none())
                .cloned()
        }))
    }

    fn thread_chunk(
        &self,
        room_id: &str,
        root_event_id: &str,
    ) -> Result<Option<ChunkRecord>, StoreError> {
        Ok(self.read_or_default(room_id, |room| {
            room.chunks
                .values()
                .find(|c| c.root_thread_event_id.as_deref() == Some(root_event_id))
                .cloned()
        }))
    }

    fn chunk_containing(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<ChunkRecord>, StoreError> {
        Ok(self.read_or_default(room_id, |room| {
            room.chunks.values().find(|chunk| chunk.contains(event_id)).cloned()
        }))
    }

    fn event(&self, room_id: &str, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.read_or_default(room_id, |room| room.events.get(event_id).cloned()))
    }

    fn events_in_chunk(
        &self,
        room_id: &str,
        chunk_id: ChunkId,
        from: Option<i64>,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.read(room_id, |room| {
            let Some(chunk) = room.chunks.get(&chunk_id) else {
                return Vec::new();
            };
            let mut events: Vec<StoredEvent> = chunk
                .event_ids
                .iter()
                .filter_map(|id| room.events.get(id).cloned())
                .collect();
            events.sort_by_key(|e| e.display_index);

            match direction {
                Direction::Forwards => {
                    let cursor = from.unwrap_or(i64::MIN);
                    events.retain(|e| e.display_index >= cursor);
                },
                Direction::Backwards => {
                    let cursor = from.unwrap_or(i64::MAX);
                    events.retain(|e| e.display_index <= cursor);
                    events.reverse();
                },
            }
            events.truncate(limit);
            events
        })
    }

    fn member_content(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Option<MembershipContent>, StoreError> {
        Ok(self.read_or_default(room_id, |room| room.members.get(user_id).cloned()))
    }

    fn latest_previewable(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_or_default(room_id, |room| room.latest_previewable.clone()))
    }

    fn sending_events(&self, room_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        Ok(self.read_or_default(room_id, |room| room.sending.clone()))
    }

    fn set_decryption_result(
        &self,
        room_id: &str,
        event_id: &str,
        result: DecryptionResult,
    ) -> Result<(), StoreError> {
        self.update_event(room_id, event_id, |stored| {
            stored.decryption = Some(result);
            stored.decryption_error = None;
        })
    }

    fn set_decryption_error(
        &self,
        room_id: &str,
        event_id: &str,
        code: DecryptionErrorCode,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.update_event(room_id, event_id, |stored| {
            stored.decryption_error = Some((code, reason.to_owned()));
        })
    }

    fn set_thread_root(
        &self,
        room_id: &str,
        event_id: &str,
        root: &str,
    ) -> Result<(), StoreError> {
        self.update_event(room_id, event_id, |stored| {
            stored.thread_root = Some(root.to_owned());
        })
    }

    #[allow(clippy::expect_used)]
    fn set_send_state(
        &self,
        room_id: &str,
        event_id: &str,
        state: SendState,
    ) -> Result<(), StoreError> {
        let touched_events = self.in_transaction(room_id, |txn| {
            let Some(mut stored) = txn.event(event_id) else { return Ok(false) };
            stored.send_state = state;
            txn.put_event(stored);
            txn.emit(StoreChange::EventUpdated {
                room_id: room_id.to_owned(),
                event_id: event_id.to_owned(),
            });
            Ok(true)
        })?;

        // Sending entries live outside the chunk graph; update in place.
        let touched_sending = {
            let mut inner = self.inner.lock().expect("Mutex poisoned");
            let mut touched = false;
            if let Some(room) = inner.rooms.get_mut(room_id) {
                for entry in &mut room.sending {
                    if entry.event_id() == event_id {
                        entry.send_state = state;
                        touched = true;
                    }
                }
            }
            touched
        };
        if touched_sending {
            let _ = self
                .changes
                .send(StoreChange::SendingEventsChanged { room_id: room_id.to_owned() });
        }

        if touched_events || touched_sending {
            Ok(())
        } else {
            Err(StoreError::EventNotFound(event_id.to_owned()))
        }
    }

    #[allow(clippy::expect_used)]
    fn add_sending_event(&self, event: StoredEvent) -> Result<(), StoreError> {
        let room_id = event.room_id.clone();
        {
            let mut inner = self.inner.lock().expect("Mutex poisoned");
            inner.rooms.entry(room_id.clone()).or_default().sending.push(event);
        }
        let _ = self.changes.send(StoreChange::SendingEventsChanged { room_id });
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn remove_sending_event(
        &self,
        room_id: &str,
        transaction_id: &str,
    ) -> Result<(), StoreError> {
        let removed = {
            let mut inner = self.inner.lock().expect("Mutex poisoned");
            let Some(room) = inner.rooms.get_mut(room_id) else { return Ok(()) };
            let before = room.sending.len();
            room.sending
                .retain(|entry| entry.event.transaction_id() != Some(transaction_id));
            before != room.sending.len()
        };
        if removed {
            let _ = self
                .changes
                .send(StoreChange::SendingEventsChanged { room_id: room_id.to_owned() });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tidemark_proto::{Event, EventKind};

    use super::*;

    fn stored(room_id: &str, event_id: &str, display_index: i64) -> StoredEvent {
        StoredEvent::synced(
            room_id,
            Event {
                event_id: event_id.to_owned(),
                sender: "@alice:example.org".to_owned(),
                kind: EventKind::Message,
                content: json!({"body": event_id}),
                origin_server_ts: 0,
                state_key: None,
                unsigned: None,
            },
            display_index,
        )
    }

    fn seed_chunk(store: &MemoryTimelineStore, room_id: &str, ids: &[&str]) -> ChunkId {
        store
            .in_transaction(room_id, |txn| {
                let mut chunk = txn.create_chunk();
                for (offset, id) in ids.iter().enumerate() {
                    txn.put_event(stored(room_id, id, offset as i64));
                    chunk.event_ids.push((*id).to_owned());
                }
                let chunk_id = chunk.id;
                txn.put_chunk(chunk);
                Ok(chunk_id)
            })
            .expect("seed should commit")
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = MemoryTimelineStore::new();
        let result: Result<(), StoreError> = store.in_transaction("!room", |txn| {
            let mut chunk = txn.create_chunk();
            chunk.event_ids.push("$e1".to_owned());
            txn.put_event(stored("!room", "$e1", 0));
            txn.put_chunk(chunk);
            Err(StoreError::TransactionFailed("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.chunk_count("!room"), 0);
        assert_eq!(store.event("!room", "$e1").unwrap(), None);
    }

    #[test]
    fn changes_publish_only_after_commit() {
        let store = MemoryTimelineStore::new();
        let mut rx = store.subscribe();

        let failed: Result<(), StoreError> = store.in_transaction("!room", |txn| {
            txn.emit(StoreChange::SendingEventsChanged { room_id: "!room".to_owned() });
            Err(StoreError::TransactionFailed("boom".into()))
        });
        assert!(failed.is_err());
        assert!(rx.try_recv().is_err());

        store
            .in_transaction("!room", |txn| {
                txn.emit(StoreChange::SendingEventsChanged { room_id: "!room".to_owned() });
                Ok(())
            })
            .expect("commit");
        assert_eq!(
            rx.try_recv().expect("change should publish"),
            StoreChange::SendingEventsChanged { room_id: "!room".to_owned() }
        );
    }

    #[test]
    fn events_in_chunk_walks_both_directions() {
        let store = MemoryTimelineStore::new();
        let chunk_id = seed_chunk(&store, "!room", &["$e0", "$e1", "$e2", "$e3"]);

        let backwards = store
            .events_in_chunk("!room", chunk_id, None, Direction::Backwards, 2)
            .expect("query");
        let ids: Vec<&str> = backwards.iter().map(StoredEvent::event_id).collect();
        assert_eq!(ids, vec!["$e3", "$e2"]);

        let forwards = store
            .events_in_chunk("!room", chunk_id, Some(1), Direction::Forwards, 10)
            .expect("query");
        let ids: Vec<&str> = forwards.iter().map(StoredEvent::event_id).collect();
        assert_eq!(ids, vec!["$e1", "$e2", "$e3"]);
    }

    #[test]
    fn delete_chunk_keeps_shared_and_state_events() {
        let store = MemoryTimelineStore::new();
        let first = seed_chunk(&store, "!room", &["$shared", "$own"]);
        let second = seed_chunk(&store, "!room", &["$shared"]);

        // Make $own a state event so the cascade must keep it.
        store
            .in_transaction("!room", |txn| {
                let mut own = txn.event("$own").expect("seeded");
                own.event.state_key = Some(String::new());
                txn.put_event(own);
                Ok(())
            })
            .expect("commit");

        store
            .in_transaction("!room", |txn| {
                txn.delete_chunk(first);
                Ok(())
            })
            .expect("commit");

        assert!(store.chunk("!room", first).unwrap().is_none());
        assert!(store.chunk("!room", second).unwrap().is_some());
        assert!(store.event("!room", "$shared").unwrap().is_some());
        assert!(store.event("!room", "$own").unwrap().is_some());
    }

    #[test]
    fn decoration_updates_are_atomic_per_event() {
        let store = MemoryTimelineStore::new();
        seed_chunk(&store, "!room", &["$e0"]);

        store
            .set_decryption_error("!room", "$e0", DecryptionErrorCode::UnknownSession, "no key")
            .expect("update");
        let with_error = store.event("!room", "$e0").unwrap().expect("stored");
        assert_eq!(
            with_error.decryption_error,
            Some((DecryptionErrorCode::UnknownSession, "no key".to_owned()))
        );

        store
            .set_decryption_result(
                "!room",
                "$e0",
                DecryptionResult { payload: json!({"body": "hi"}), session_id: None },
            )
            .expect("update");
        let decrypted = store.event("!room", "$e0").unwrap().expect("stored");
        assert!(decrypted.decryption.is_some());
        assert_eq!(decrypted.decryption_error, None);
    }

    #[test]
    fn sending_collection_round_trip() {
        let store = MemoryTimelineStore::new();
        let mut pending = stored("!room", "$local-1", 0);
        pending.send_state = SendState::Sending;
        pending.event.unsigned = Some(tidemark_proto::UnsignedData {
            transaction_id: Some("txn-1".to_owned()),
            prev_content: None,
        });

        store.add_sending_event(pending).expect("add");
        assert_eq!(store.sending_events("!room").unwrap().len(), 1);

        store.remove_sending_event("!room", "txn-1").expect("remove");
        assert!(store.sending_events("!room").unwrap().is_empty());

        // Removing again is a harmless no-op.
        store.remove_sending_event("!room", "txn-1").expect("remove");
    }
}
