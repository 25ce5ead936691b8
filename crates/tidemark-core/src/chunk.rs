//! Chunk records.
//!
//! A chunk is a bounded, token-delimited contiguous run of room history.
//! Chunks live in the store as an arena keyed by opaque [`ChunkId`]s;
//! adjacency is stored as ids, never as owning references, so the graph can
//! contain back-and-forth links without ownership cycles.

use std::fmt;

use serde::{Deserialize, Serialize};
use tidemark_proto::Direction;

/// Opaque arena key for a chunk record. Assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Persisted segment of room history.
///
/// # Invariants
///
/// - At most one chunk per room (and per thread scope) has
///   `is_last_forward == true`; its `next_token` is unused.
/// - After a merge pass completes, no two chunks in a room share an event
///   id.
/// - `event_ids` is ordered forward (oldest first) and mirrors the stored
///   events' display indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Arena key.
    pub id: ChunkId,
    /// Room this chunk belongs to.
    pub room_id: String,
    /// Pagination token at the backward (older) edge.
    pub prev_token: Option<String>,
    /// Pagination token at the forward (newer) edge.
    pub next_token: Option<String>,
    /// Whether this chunk is the known live/forward edge of the room.
    pub is_last_forward: bool,
    /// Whether this chunk is the known oldest edge of the room.
    pub is_last_backward: bool,
    /// Sticky marker: this chunk held `is_last_forward` at some point.
    /// Survives displacement; used to resolve a token when paginating
    /// forward out of a formerly-live chunk.
    pub was_live_forward: bool,
    /// Adjacent chunk toward the past, when known.
    pub prev_chunk: Option<ChunkId>,
    /// Adjacent chunk toward the future, when known.
    pub next_chunk: Option<ChunkId>,
    /// Member event ids in forward order (oldest first).
    pub event_ids: Vec<String>,
    /// Thread root event id when this chunk is thread-scoped.
    pub root_thread_event_id: Option<String>,
    /// Whether this chunk is the live edge of its thread scope.
    pub is_last_forward_thread: bool,
}

impl ChunkRecord {
    /// A fresh unlinked chunk with the given tokens.
    pub fn new(id: ChunkId, room_id: impl Into<String>) -> Self {
        Self {
            id,
            room_id: room_id.into(),
            prev_token: None,
            next_token: None,
            is_last_forward: false,
            is_last_backward: false,
            was_live_forward: false,
            prev_chunk: None,
            next_chunk: None,
            event_ids: Vec::new(),
            root_thread_event_id: None,
            is_last_forward_thread: false,
        }
    }

    /// Edge token in the given direction of travel.
    pub fn token_toward(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Forwards => self.next_token.as_deref(),
            Direction::Backwards => self.prev_token.as_deref(),
        }
    }

    /// Adjacent chunk id in the given direction of travel.
    pub fn neighbor_toward(&self, direction: Direction) -> Option<ChunkId> {
        match direction {
            Direction::Forwards => self.next_chunk,
            Direction::Backwards => self.prev_chunk,
        }
    }

    /// Whether this chunk is a confirmed terminal edge in the direction.
    ///
    /// Thread-scoped chunks answer for their thread scope on the forward
    /// side.
    pub fn is_last_in(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forwards => {
                if self.root_thread_event_id.is_some() {
                    self.is_last_forward_thread
                } else {
                    self.is_last_forward
                }
            },
            Direction::Backwards => self.is_last_backward,
        }
    }

    /// Whether the chunk currently holds `event_id`.
    pub fn contains(&self, event_id: &str) -> bool {
        self.event_ids.iter().any(|id| id == event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_and_neighbor_follow_direction() {
        let mut chunk = ChunkRecord::new(ChunkId(1), "!room");
        chunk.prev_token = Some("older".into());
        chunk.next_token = Some("newer".into());
        chunk.prev_chunk = Some(ChunkId(2));

        assert_eq!(chunk.token_toward(Direction::Backwards), Some("older"));
        assert_eq!(chunk.token_toward(Direction::Forwards), Some("newer"));
        assert_eq!(chunk.neighbor_toward(Direction::Backwards), Some(ChunkId(2)));
        assert_eq!(chunk.neighbor_toward(Direction::Forwards), None);
    }

    #[test]
    fn thread_scope_uses_thread_flag_for_forward_edge() {
        let mut chunk = ChunkRecord::new(ChunkId(1), "!room");
        chunk.is_last_forward = true;
        assert!(chunk.is_last_in(Direction::Forwards));

        chunk.root_thread_event_id = Some("$root".into());
        assert!(!chunk.is_last_in(Direction::Forwards));

        chunk.is_last_forward_thread = true;
        assert!(chunk.is_last_in(Direction::Forwards));
    }
}
