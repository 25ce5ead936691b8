//! Chunk merge persistor.
//!
//! Folds server-delivered pages into the room's chunk graph: locates or
//! creates the chunk a page extends, applies its events with fresh display
//! indices, marks terminal edges on empty end-of-history pages, and
//! absorbs any chunk that overlaps the page's events so that no two live
//! chunks ever share an event id.
//!
//! Every page is applied inside a single store transaction. Malformed
//! events are dropped without aborting it; a substrate failure aborts the
//! whole page.

use tidemark_proto::{Direction, Event, EventKind, Page, RelationKind};

use crate::{
    ChunkId, ChunkRecord, ReactionAggregate, SenderProfile, StoreChange, StoreError, StoredEvent,
    store::{StoreTxn, TimelineStore},
};

/// Cap on overlap merges processed for one page.
///
/// The overlap query is unbounded by construction: a pathological server
/// can hand back pages overlapping arbitrarily many chunks. Chunks beyond
/// the cap stay live and are absorbed by a later page application.
pub const MAX_CHUNK_MERGES_PER_PAGE: usize = 16;

/// Result of applying one page to the chunk graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The page carried events and was applied.
    Success,
    /// The page was empty but a continuation token promises more data;
    /// the caller should retry the fetch with that token.
    ShouldFetchMore,
    /// The page was empty with no continuation token: the edge of history.
    ReachedEnd,
}

/// Applies pagination responses to the persisted chunk graph.
pub struct PagePersistor<S> {
    store: S,
}

impl<S: TimelineStore> PagePersistor<S> {
    /// Create a persistor over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply a pagination page extending the timeline in `direction`.
    pub fn insert_page(
        &self,
        room_id: &str,
        page: &Page,
        direction: Direction,
    ) -> Result<InsertOutcome, StoreError> {
        self.store.in_transaction(room_id, |txn| {
            let mut current = locate_or_create(txn, page, direction);

            if page.events.is_empty() {
                if page.has_more() {
                    txn.put_chunk(current);
                    return Ok(InsertOutcome::ShouldFetchMore);
                }
                handle_reach_end(txn, &mut current, direction);
                txn.put_chunk(current);
                return Ok(InsertOutcome::ReachedEnd);
            }

            let applied = apply_events(txn, room_id, &mut current, page, direction);
            // A non-empty page without a continuation token also proves the
            // edge; the flag is set here so later loads short-circuit, but
            // the result code stays Success because events were applied.
            if !page.has_more() {
                handle_reach_end(txn, &mut current, direction);
            }
            txn.put_chunk(current.clone());
            if !applied.is_empty() {
                txn.emit(StoreChange::EventsInserted {
                    room_id: room_id.to_owned(),
                    chunk_id: current.id,
                    event_ids: applied,
                });
            }

            merge_overlaps(txn, room_id, current.id, &page.event_ids(), direction)?;
            Ok(InsertOutcome::Success)
        })
    }

    /// Apply a context page centered on an event.
    ///
    /// Same merge algorithm without terminal marking; returns the chunk now
    /// holding the page so a timeline can anchor on it.
    pub fn insert_context_page(
        &self,
        room_id: &str,
        page: &Page,
    ) -> Result<ChunkId, StoreError> {
        self.store.in_transaction(room_id, |txn| {
            let page_ids = page.event_ids();
            // Anchor on a main-timeline chunk; thread chunks duplicate
            // events on purpose and must not capture context pages.
            let mut current = match txn
                .chunks_containing(&page_ids)
                .into_iter()
                .find(|chunk| chunk.root_thread_event_id.is_none())
            {
                Some(existing) => existing,
                None => txn.create_chunk(),
            };
            if current.prev_token.is_none() {
                current.prev_token.clone_from(&page.start);
            }
            if current.next_token.is_none() {
                current.next_token.clone_from(&page.end);
            }
            link_neighbors(txn, &mut current);

            let applied = apply_events(txn, room_id, &mut current, page, Direction::Forwards);
            let chunk_id = current.id;
            txn.put_chunk(current);
            if !applied.is_empty() {
                txn.emit(StoreChange::EventsInserted {
                    room_id: room_id.to_owned(),
                    chunk_id,
                    event_ids: applied,
                });
            }

            merge_overlaps(txn, room_id, chunk_id, &page_ids, Direction::Forwards)?;
            Ok(chunk_id)
        })
    }

    /// The room's live chunk, creating an empty one when missing.
    ///
    /// `prev_token` seeds the backward edge of a freshly created chunk (the
    /// initial sync page's back-pagination token). When no live chunk
    /// existed, the new one wins the flag outright.
    pub fn ensure_live_chunk(
        &self,
        room_id: &str,
        prev_token: Option<&str>,
    ) -> Result<ChunkRecord, StoreError> {
        self.store.in_transaction(room_id, |txn| {
            if let Some(live) = txn.live_chunk() {
                return Ok(live);
            }
            let mut chunk = txn.create_chunk();
            chunk.prev_token = prev_token.map(ToOwned::to_owned);
            chunk.is_last_forward = true;
            chunk.was_live_forward = true;
            txn.put_chunk(chunk.clone());
            Ok(chunk)
        })
    }

    /// Recreate the isolated thread chunk for a thread root.
    ///
    /// Any stale chunk for the same root is cascade-deleted first; entering
    /// thread mode always starts from a fresh forward chunk.
    pub fn reset_thread_chunk(
        &self,
        room_id: &str,
        root_event_id: &str,
    ) -> Result<ChunkRecord, StoreError> {
        self.store.in_transaction(room_id, |txn| {
            if let Some(stale) = txn.thread_chunk(root_event_id) {
                txn.delete_chunk(stale.id);
            }
            let mut chunk = txn.create_chunk();
            chunk.root_thread_event_id = Some(root_event_id.to_owned());
            chunk.is_last_forward_thread = true;
            txn.put_chunk(chunk.clone());
            Ok(chunk)
        })
    }

    /// Delete the isolated thread chunk for a thread root, if present.
    ///
    /// Leaving thread mode clears its scope; re-entering starts fresh.
    pub fn clear_thread_chunk(
        &self,
        room_id: &str,
        root_event_id: &str,
    ) -> Result<(), StoreError> {
        self.store.in_transaction(room_id, |txn| {
            if let Some(chunk) = txn.thread_chunk(root_event_id) {
                txn.delete_chunk(chunk.id);
            }
            Ok(())
        })
    }

    /// Delete every chunk of a room (the room was left).
    pub fn clear_room(&self, room_id: &str) -> Result<(), StoreError> {
        self.store.in_transaction(room_id, |txn| {
            for chunk in txn.all_chunks() {
                txn.delete_chunk(chunk.id);
            }
            txn.set_latest_previewable(None);
            Ok(())
        })
    }
}

/// Locate the chunk a page extends, or create a fresh unlinked one.
///
/// The chunk being extended is the one whose travel-direction edge token
/// equals the page's `start`; the chunk on the far side (opposite edge
/// token equal to `end`) is linked as adjacency.
fn locate_or_create(txn: &mut dyn StoreTxn, page: &Page, direction: Direction) -> ChunkRecord {
    let existing = page.start.as_deref().and_then(|token| match direction {
        Direction::Backwards => txn.find_chunk_by_prev_token(token),
        Direction::Forwards => txn.find_chunk_by_next_token(token),
    });

    let mut current = match existing {
        Some(mut chunk) => {
            match direction {
                Direction::Backwards => chunk.prev_token.clone_from(&page.end),
                Direction::Forwards => chunk.next_token.clone_from(&page.end),
            }
            chunk
        },
        None => {
            let mut chunk = txn.create_chunk();
            match direction {
                Direction::Backwards => {
                    chunk.next_token.clone_from(&page.start);
                    chunk.prev_token.clone_from(&page.end);
                },
                Direction::Forwards => {
                    chunk.prev_token.clone_from(&page.start);
                    chunk.next_token.clone_from(&page.end);
                },
            }
            chunk
        },
    };

    link_neighbors(txn, &mut current);
    current
}

/// Wire adjacency between `current` and any chunk sharing an edge token.
fn link_neighbors(txn: &mut dyn StoreTxn, current: &mut ChunkRecord) {
    if current.prev_chunk.is_none()
        && let Some(token) = current.prev_token.as_deref()
        && let Some(mut older) = txn.find_chunk_by_next_token(token)
        && older.id != current.id
    {
        current.prev_chunk = Some(older.id);
        older.next_chunk = Some(current.id);
        txn.put_chunk(older);
    }
    if current.next_chunk.is_none()
        && let Some(token) = current.next_token.as_deref()
        && let Some(mut newer) = txn.find_chunk_by_prev_token(token)
        && newer.id != current.id
    {
        current.next_chunk = Some(newer.id);
        newer.prev_chunk = Some(current.id);
        txn.put_chunk(newer);
    }
}

/// Mark `current` as the terminal edge for `direction`.
///
/// A forward reach-end may displace the previous live chunk, whose
/// now-redundant copy is cascade-deleted. When no live chunk existed, the
/// current chunk wins the flag (most recently extended wins).
fn handle_reach_end(txn: &mut dyn StoreTxn, current: &mut ChunkRecord, direction: Direction) {
    match direction {
        Direction::Backwards => {
            // A room has one history start; a second claim displaces the
            // old flag without deleting the chunk.
            for mut other in txn.all_chunks() {
                if other.id != current.id && other.is_last_backward {
                    other.is_last_backward = false;
                    txn.put_chunk(other);
                }
            }
            current.is_last_backward = true;
        },
        Direction::Forwards => {
            if current.root_thread_event_id.is_some() {
                current.is_last_forward_thread = true;
                return;
            }
            if let Some(live) = txn.live_chunk()
                && live.id != current.id
            {
                txn.delete_chunk(live.id);
                if current.prev_chunk == Some(live.id) {
                    current.prev_chunk = None;
                }
                if current.next_chunk == Some(live.id) {
                    current.next_chunk = None;
                }
            }
            current.is_last_forward = true;
            current.was_live_forward = true;
            txn.set_latest_previewable(current.event_ids.last().cloned());
        },
    }
}

/// Apply a page's state and timeline events to `current`.
///
/// Returns the ids actually inserted (duplicates within the chunk are
/// skipped, making re-application idempotent).
fn apply_events(
    txn: &mut dyn StoreTxn,
    room_id: &str,
    current: &mut ChunkRecord,
    page: &Page,
    direction: Direction,
) -> Vec<String> {
    let use_prev_content = direction == Direction::Backwards;

    for state in &page.state_events {
        if let Err(error) = state.validate() {
            tracing::warn!(room = room_id, %error, "dropping malformed state event");
            continue;
        }
        record_member_content(txn, state, use_prev_content);
        if txn.event(&state.event_id).is_none() {
            txn.put_event(StoredEvent::synced(room_id, state.clone(), 0));
        }
    }

    let mut bounds = txn.display_bounds(current.id);
    let mut applied = Vec::new();

    for event in &page.events {
        if let Err(error) = event.validate() {
            tracing::warn!(room = room_id, %error, "dropping malformed event from page");
            continue;
        }
        if current.contains(&event.event_id) {
            continue;
        }

        record_member_content(txn, event, use_prev_content);

        let display_index = match (direction, bounds) {
            (_, None) => 0,
            (Direction::Forwards, Some((_, max))) => max + 1,
            (Direction::Backwards, Some((min, _))) => min - 1,
        };
        bounds = Some(match bounds {
            None => (display_index, display_index),
            Some((min, max)) => (min.min(display_index), max.max(display_index)),
        });

        let mut stored = match txn.event(&event.event_id) {
            // Already known from an overlapping chunk: keep decorations,
            // only re-seat the ordering key.
            Some(mut existing) => {
                existing.display_index = display_index;
                existing
            },
            None => StoredEvent::synced(room_id, event.clone(), display_index),
        };
        stored.sender_profile = txn.member_content(&event.sender).map(|content| SenderProfile {
            display_name: content.display_name,
            avatar_url: content.avatar_url,
        });
        stored.thread_root = event.thread_root().or_else(|| current.root_thread_event_id.clone());
        txn.put_event(stored);

        match direction {
            Direction::Forwards => current.event_ids.push(event.event_id.clone()),
            Direction::Backwards => current.event_ids.insert(0, event.event_id.clone()),
        }
        aggregate_reaction(txn, room_id, event);
        applied.push(event.event_id.clone());
    }

    if current.is_last_forward {
        txn.set_latest_previewable(current.event_ids.last().cloned());
    }
    applied
}

/// Fold a member event into the room's member-content map (last-wins).
fn record_member_content(txn: &mut dyn StoreTxn, event: &Event, use_prev_content: bool) {
    let Some(user_id) = event.state_key.as_deref() else { return };
    let Some(content) = event.membership_content(use_prev_content) else { return };
    txn.set_member_content(user_id, content);
}

/// Fold a reaction event into its target's persisted aggregate.
fn aggregate_reaction(txn: &mut dyn StoreTxn, room_id: &str, event: &Event) {
    if event.kind != EventKind::Reaction {
        return;
    }
    let Some(relation) = event.relates_to() else { return };
    if relation.kind != RelationKind::Annotation {
        return;
    }
    let Some(key) = relation.key else { return };
    let Some(mut target) = txn.event(&relation.event_id) else { return };

    let slot = match target.reactions.iter().position(|agg| agg.key == key) {
        Some(position) => position,
        None => {
            target.reactions.push(ReactionAggregate {
                key,
                count: 0,
                added_by_me: false,
                source_event_ids: Vec::new(),
            });
            target.reactions.len() - 1
        },
    };
    let aggregate = &mut target.reactions[slot];
    if aggregate.source_event_ids.iter().any(|id| id == &event.event_id) {
        return;
    }
    aggregate.count += 1;
    aggregate.source_event_ids.push(event.event_id.clone());

    let target_id = target.event_id().to_owned();
    txn.put_event(target);
    txn.emit(StoreChange::EventUpdated { room_id: room_id.to_owned(), event_id: target_id });
}

/// Absorb every chunk overlapping the page's events into `current_id`.
fn merge_overlaps(
    txn: &mut dyn StoreTxn,
    room_id: &str,
    current_id: ChunkId,
    page_ids: &[String],
    direction: Direction,
) -> Result<(), StoreError> {
    if page_ids.is_empty() {
        return Ok(());
    }
    let mut current =
        txn.chunk(current_id).ok_or(StoreError::ChunkNotFound(current_id))?;

    // Merging is scoped per room+thread: a main-timeline page must never
    // absorb a thread chunk (threads intentionally duplicate events).
    let others: Vec<ChunkRecord> = txn
        .chunks_containing(page_ids)
        .into_iter()
        .filter(|chunk| {
            chunk.id != current_id
                && chunk.root_thread_event_id == current.root_thread_event_id
        })
        .collect();
    if others.len() > MAX_CHUNK_MERGES_PER_PAGE {
        tracing::warn!(
            room = room_id,
            found = others.len(),
            cap = MAX_CHUNK_MERGES_PER_PAGE,
            "overlap merge cap hit; remaining chunks deferred to a later page"
        );
    }

    for other in others.into_iter().take(MAX_CHUNK_MERGES_PER_PAGE) {
        // Re-read: adjacency rewrites from a previous merge may have
        // touched this record.
        let Some(other) = txn.chunk(other.id) else { continue };
        merge_into(txn, room_id, &mut current, other, direction);
    }
    Ok(())
}

/// Merge `other`'s full event ordering into `current` and delete it.
fn merge_into(
    txn: &mut dyn StoreTxn,
    room_id: &str,
    current: &mut ChunkRecord,
    other: ChunkRecord,
    direction: Direction,
) {
    let append = other_is_futureward(current, &other, direction);

    let new_ids: Vec<String> = other
        .event_ids
        .iter()
        .filter(|id| !current.contains(id))
        .cloned()
        .collect();

    if append {
        let start = txn.display_bounds(current.id).map_or(0, |(_, max)| max + 1);
        for (offset, id) in new_ids.iter().enumerate() {
            reseat_event(txn, id, start + offset as i64);
        }
        current.event_ids.extend(new_ids.iter().cloned());

        // Adopt the absorbed chunk's outer edge. A None token is only
        // meaningful when backed by a terminal flag (the live edge).
        if other.next_token.is_some() || other.is_last_forward {
            current.next_token.clone_from(&other.next_token);
        }
        if other.next_chunk.is_some() {
            current.next_chunk = other.next_chunk;
        }
    } else {
        let end = txn.display_bounds(current.id).map_or(0, |(min, _)| min - 1);
        let count = new_ids.len() as i64;
        for (offset, id) in new_ids.iter().enumerate() {
            reseat_event(txn, id, end - count + 1 + offset as i64);
        }
        let mut merged = new_ids.clone();
        merged.extend(current.event_ids.iter().cloned());
        current.event_ids = merged;

        if other.prev_token.is_some() || other.is_last_backward {
            current.prev_token.clone_from(&other.prev_token);
        }
        if other.prev_chunk.is_some() {
            current.prev_chunk = other.prev_chunk;
        }
    }
    // Terminal flags transfer regardless of which side was absorbed; the
    // deleted chunk must never take a room edge with it.
    current.is_last_forward |= other.is_last_forward;
    current.is_last_forward_thread |= other.is_last_forward_thread;
    current.is_last_backward |= other.is_last_backward;
    current.was_live_forward |= other.was_live_forward;

    if current.prev_chunk == Some(other.id) || current.prev_chunk == Some(current.id) {
        current.prev_chunk = None;
    }
    if current.next_chunk == Some(other.id) || current.next_chunk == Some(current.id) {
        current.next_chunk = None;
    }
    // Adopted adjacency must point back at the surviving chunk, and the
    // survivor must own the absorbed events before the cascade delete runs
    // (shared events survive it, orphans do not).
    for neighbor_id in [current.prev_chunk, current.next_chunk].into_iter().flatten() {
        if let Some(mut neighbor) = txn.chunk(neighbor_id) {
            if neighbor.prev_chunk == Some(other.id) {
                neighbor.prev_chunk = Some(current.id);
            }
            if neighbor.next_chunk == Some(other.id) {
                neighbor.next_chunk = Some(current.id);
            }
            txn.put_chunk(neighbor);
        }
    }
    txn.put_chunk(current.clone());
    txn.delete_chunk(other.id);

    if !new_ids.is_empty() {
        txn.emit(StoreChange::EventsInserted {
            room_id: room_id.to_owned(),
            chunk_id: current.id,
            event_ids: new_ids,
        });
    }
    tracing::debug!(room = room_id, absorbed = %other.id, into = %current.id, "merged chunks");
}

/// Decide whether `other` extends `current` toward the future.
///
/// Token adjacency is authoritative when present. Otherwise the position of
/// a shared event decides: shared history near `other`'s oldest edge means
/// `other` continues past `current`'s newest edge. With no signal either
/// way, the travel direction of the page that triggered the merge decides.
fn other_is_futureward(current: &ChunkRecord, other: &ChunkRecord, direction: Direction) -> bool {
    if other.prev_token.is_some() && other.prev_token == current.next_token {
        return true;
    }
    if other.next_token.is_some() && other.next_token == current.prev_token {
        return false;
    }

    if let Some(shared_pos) = other
        .event_ids
        .iter()
        .position(|id| current.contains(id))
    {
        let from_oldest = shared_pos;
        let from_newest = other.event_ids.len() - 1 - shared_pos;
        if from_oldest != from_newest {
            return from_oldest < from_newest;
        }
    }

    direction == Direction::Forwards
}

/// Move an event's ordering key without touching its decorations.
fn reseat_event(txn: &mut dyn StoreTxn, event_id: &str, display_index: i64) {
    if let Some(mut event) = txn.event(event_id) {
        event.display_index = display_index;
        txn.put_event(event);
    }
}
