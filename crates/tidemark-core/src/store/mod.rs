//! Storage abstraction for the timeline engine.
//!
//! [`TimelineStore`] marks the persistence substrate boundary: transactional
//! read/write access keyed by room id and event id, plus a change feed that
//! replaces substrate-level listener callbacks with explicit channel
//! handoff. The trait is synchronous; callers run it from the timeline's
//! dedicated background task, so a blocking transaction suspends that task
//! and nothing else.
//!
//! Must be Clone (handles are shared across components), Send + Sync.
//! Implementations typically share internal state via Arc, so clones access
//! the same underlying storage.

pub mod memory;

use tidemark_proto::{Direction, MembershipContent};
use tokio::sync::broadcast;

use crate::{
    ChunkId, ChunkRecord, DecryptionErrorCode, DecryptionResult, SendState, StoreError,
    StoredEvent,
};

/// Change notification published by the store after a committed write.
///
/// Consumers subscribe once per store and route by room and chunk id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Events were added to a chunk (page application or chunk merge).
    EventsInserted {
        /// Room the chunk belongs to.
        room_id: String,
        /// Chunk that received the events.
        chunk_id: ChunkId,
        /// Ids of the inserted events, in insertion order.
        event_ids: Vec<String>,
    },
    /// A stored event's decorations changed (decryption, send state,
    /// reactions, thread link).
    EventUpdated {
        /// Room the event belongs to.
        room_id: String,
        /// Id of the updated event.
        event_id: String,
    },
    /// A chunk was deleted (merge absorption, thread reset, room left).
    ChunkDeleted {
        /// Room the chunk belonged to.
        room_id: String,
        /// Id of the deleted chunk.
        chunk_id: ChunkId,
    },
    /// The room's sending-events collection changed.
    SendingEventsChanged {
        /// Room whose collection changed.
        room_id: String,
    },
}

/// Room-scoped transaction handle.
///
/// All reads observe the transaction's own uncommitted writes. A transaction
/// commits if and only if the closure passed to
/// [`TimelineStore::in_transaction`] returns `Ok`; nothing is visible to
/// other readers (and no change is published) before commit.
pub trait StoreTxn {
    /// Chunk by id.
    fn chunk(&self, id: ChunkId) -> Option<ChunkRecord>;

    /// Chunk whose forward-edge token equals `token`.
    fn find_chunk_by_next_token(&self, token: &str) -> Option<ChunkRecord>;

    /// Chunk whose backward-edge token equals `token`.
    fn find_chunk_by_prev_token(&self, token: &str) -> Option<ChunkRecord>;

    /// The room's live chunk (`is_last_forward`), if any.
    fn live_chunk(&self) -> Option<ChunkRecord>;

    /// The live chunk of a thread scope, if any.
    fn thread_chunk(&self, root_event_id: &str) -> Option<ChunkRecord>;

    /// All chunks containing at least one of `event_ids`.
    fn chunks_containing(&self, event_ids: &[String]) -> Vec<ChunkRecord>;

    /// Every chunk record of the room, in unspecified order.
    fn all_chunks(&self) -> Vec<ChunkRecord>;

    /// Stored event by id.
    fn event(&self, event_id: &str) -> Option<StoredEvent>;

    /// Current member-state content for a user.
    fn member_content(&self, user_id: &str) -> Option<MembershipContent>;

    /// `(min, max)` display indices of a chunk's stored events.
    fn display_bounds(&self, chunk_id: ChunkId) -> Option<(i64, i64)>;

    /// Allocate and register a fresh unlinked chunk.
    fn create_chunk(&mut self) -> ChunkRecord;

    /// Insert or replace a chunk record.
    fn put_chunk(&mut self, chunk: ChunkRecord);

    /// Delete a chunk, cascading to its events.
    ///
    /// Events shared with another chunk and state events survive the
    /// cascade; adjacency pointers referencing the chunk are cleared.
    fn delete_chunk(&mut self, id: ChunkId);

    /// Insert or replace a stored event record.
    fn put_event(&mut self, event: StoredEvent);

    /// Update the room's member-content map (last-wins per user).
    fn set_member_content(&mut self, user_id: &str, content: MembershipContent);

    /// Update the room summary's latest previewable event.
    fn set_latest_previewable(&mut self, event_id: Option<String>);

    /// Queue a change notification, published on commit.
    fn emit(&mut self, change: StoreChange);
}

/// Storage abstraction for chunks, events, and room caches.
pub trait TimelineStore: Clone + Send + Sync + 'static {
    /// Run `f` inside a room-scoped transaction.
    ///
    /// All-or-nothing: if `f` returns `Err`, every write made through the
    /// transaction handle is discarded and no change notification is
    /// published.
    fn in_transaction<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut dyn StoreTxn) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>;

    /// Chunk by id.
    fn chunk(&self, room_id: &str, id: ChunkId) -> Result<Option<ChunkRecord>, StoreError>;

    /// The room's live chunk, if any.
    fn live_chunk(&self, room_id: &str) -> Result<Option<ChunkRecord>, StoreError>;

    /// The live chunk of a thread scope, if any.
    fn thread_chunk(
        &self,
        room_id: &str,
        root_event_id: &str,
    ) -> Result<Option<ChunkRecord>, StoreError>;

    /// Any chunk containing `event_id`, if one exists.
    fn chunk_containing(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<ChunkRecord>, StoreError>;

    /// Stored event by id.
    fn event(&self, room_id: &str, event_id: &str) -> Result<Option<StoredEvent>, StoreError>;

    /// Up to `limit` of a chunk's events walking `direction` from `from`.
    ///
    /// `from` is an inclusive display index; `None` starts at the chunk's
    /// edge for the direction (newest for backwards, oldest for forwards).
    /// Results come back in walk order.
    fn events_in_chunk(
        &self,
        room_id: &str,
        chunk_id: ChunkId,
        from: Option<i64>,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Current member-state content for a user.
    fn member_content(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Option<MembershipContent>, StoreError>;

    /// The room summary's latest previewable event id.
    fn latest_previewable(&self, room_id: &str) -> Result<Option<String>, StoreError>;

    /// The room's pending sending events, oldest first.
    fn sending_events(&self, room_id: &str) -> Result<Vec<StoredEvent>, StoreError>;

    /// Persist a successful decryption result. Atomic per event.
    fn set_decryption_result(
        &self,
        room_id: &str,
        event_id: &str,
        result: DecryptionResult,
    ) -> Result<(), StoreError>;

    /// Persist a classified decryption failure. Atomic per event.
    fn set_decryption_error(
        &self,
        room_id: &str,
        event_id: &str,
        code: DecryptionErrorCode,
        reason: &str,
    ) -> Result<(), StoreError>;

    /// Record the thread root an event belongs to.
    fn set_thread_root(&self, room_id: &str, event_id: &str, root: &str)
    -> Result<(), StoreError>;

    /// Update an event's send state (events table and sending collection).
    fn set_send_state(
        &self,
        room_id: &str,
        event_id: &str,
        state: SendState,
    ) -> Result<(), StoreError>;

    /// Append to the room's sending-events collection.
    fn add_sending_event(&self, event: StoredEvent) -> Result<(), StoreError>;

    /// Remove a sending event by its transaction id.
    ///
    /// No-op when no entry matches (the echo may have been superseded).
    fn remove_sending_event(&self, room_id: &str, transaction_id: &str)
    -> Result<(), StoreError>;

    /// Subscribe to committed change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
