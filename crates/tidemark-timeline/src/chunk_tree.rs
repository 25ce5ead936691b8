//! In-memory chunk tree.
//!
//! A [`TimelineChunk`] wraps one persisted chunk and lazily owns at most
//! one live wrapper per direction. Loading drains the local store first,
//! then delegates the deficit to the adjacent chunk's wrapper, and only
//! then reaches for the network. Ownership is strict: each wrapper owns
//! its children, and closing a wrapper detaches the subtree in the
//! requested direction.
//!
//! The built window is held newest-first so that concatenation across
//! wrappers (next chain, own events, prev chain) yields one globally
//! consistent forward-to-backward order.

use std::sync::Arc;

use tidemark_core::{
    ChunkId, ChunkRecord, InsertOutcome, PagePersistor, StoreChange, StoreError, StoredEvent,
    TimelineStore,
};
use tidemark_proto::{Direction, RoomEventFilter};

use crate::{
    api::PaginationApi,
    decrypt::{DecryptionQueue, DecryptionRequest},
    echo::UiEchoReconciler,
    item::TimelineItem,
};

/// Retry budget for empty pages that promise more data.
const MAX_EMPTY_PAGE_RETRIES: usize = 3;

/// Outcome of one `load_more` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMoreOutcome {
    /// At least part of the requested window was produced.
    Success,
    /// The confirmed edge of history in that direction.
    ReachedEnd,
    /// The load could not make progress (network failure, missing token).
    Failure,
}

/// Collaborators shared by every wrapper of one timeline's tree.
#[derive(Clone)]
pub(crate) struct ChunkContext<S: TimelineStore> {
    pub room_id: String,
    pub timeline_id: String,
    pub store: S,
    pub persistor: Arc<PagePersistor<S>>,
    pub paginator: Arc<dyn PaginationApi>,
    pub decryptor: DecryptionQueue<S>,
    pub echoes: Arc<UiEchoReconciler>,
    pub filters: RoomEventFilter,
    pub use_live_sender_info: bool,
}

/// Wrapper over one persisted chunk plus lazily-built neighbor links.
pub(crate) struct TimelineChunk<S: TimelineStore> {
    ctx: ChunkContext<S>,
    chunk_id: ChunkId,
    initial_event_id: Option<String>,
    /// Built window, newest first.
    built: Vec<TimelineItem>,
    next: Option<Box<TimelineChunk<S>>>,
    prev: Option<Box<TimelineChunk<S>>>,
}

impl<S: TimelineStore> TimelineChunk<S> {
    pub fn new(ctx: ChunkContext<S>, chunk_id: ChunkId, initial_event_id: Option<String>) -> Self {
        Self { ctx, chunk_id, initial_event_id, built: Vec::new(), next: None, prev: None }
    }

    /// Grow the built window by `count` events walking `direction`.
    ///
    /// Store first, then the adjacent chunk's wrapper, then the network.
    pub async fn load_more(&mut self, count: usize, direction: Direction) -> LoadMoreOutcome {
        let loaded = match self.load_from_store(count, direction) {
            Ok(loaded) => loaded,
            Err(error) => {
                tracing::warn!(chunk = %self.chunk_id, %error, "store load failed");
                return LoadMoreOutcome::Failure;
            },
        };
        if loaded >= count {
            return LoadMoreOutcome::Success;
        }
        let deficit = count - loaded;

        let record = match self.ctx.store.chunk(&self.ctx.room_id, self.chunk_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(chunk = %self.chunk_id, "chunk record vanished");
                return LoadMoreOutcome::Failure;
            },
            Err(error) => {
                tracing::warn!(chunk = %self.chunk_id, %error, "chunk read failed");
                return LoadMoreOutcome::Failure;
            },
        };

        let outcome = if let Some(neighbor) = record.neighbor_toward(direction) {
            let ctx = self.ctx.clone();
            let child = self.child_mut(direction);
            let child =
                child.get_or_insert_with(|| Box::new(TimelineChunk::new(ctx, neighbor, None)));
            Box::pin(child.load_more(deficit, direction)).await
        } else {
            match record.token_toward(direction) {
                Some(token) => {
                    let token = token.to_owned();
                    self.fetch_from_server(token, deficit, direction).await
                },
                None if record.is_last_in(direction) => LoadMoreOutcome::ReachedEnd,
                None if direction == Direction::Forwards && record.was_live_forward => {
                    self.resolve_token_and_fetch(&record, deficit, direction).await
                },
                None => LoadMoreOutcome::Failure,
            }
        };

        // A partial window is still progress; don't report it as failure.
        if outcome == LoadMoreOutcome::Failure && loaded > 0 {
            LoadMoreOutcome::Success
        } else {
            outcome
        }
    }

    /// Concatenate the built windows of the materialized tree.
    pub fn built_items(&self, include_next: bool, include_prev: bool) -> Vec<TimelineItem> {
        let mut items = Vec::with_capacity(self.built.len());
        if include_next && let Some(next) = &self.next {
            items.extend(next.built_items(true, false));
        }
        items.extend(self.built.iter().cloned());
        if include_prev && let Some(prev) = &self.prev {
            items.extend(prev.built_items(false, true));
        }
        items
    }

    /// Route a store change through the tree.
    ///
    /// Returns whether any built window changed (the owner debounces the
    /// resulting snapshot).
    pub fn handle_store_change(&mut self, change: &StoreChange) -> bool {
        let mut changed = match change {
            StoreChange::EventsInserted { room_id, chunk_id, event_ids }
                if *room_id == self.ctx.room_id && *chunk_id == self.chunk_id =>
            {
                self.splice_inserted(event_ids)
            },
            StoreChange::EventUpdated { room_id, event_id } if *room_id == self.ctx.room_id => {
                self.refresh_built(event_id)
            },
            StoreChange::ChunkDeleted { room_id, chunk_id }
                if *room_id == self.ctx.room_id && *chunk_id == self.chunk_id =>
            {
                self.reanchor();
                false
            },
            _ => false,
        };

        if let Some(next) = &mut self.next {
            changed |= next.handle_store_change(change);
        }
        if let Some(prev) = &mut self.prev {
            changed |= prev.handle_store_change(change);
        }
        if matches!(change, StoreChange::ChunkDeleted { .. }) {
            self.prune_children();
        }
        changed
    }

    /// Rebuild one built slot from the store (echo decoration changed).
    pub fn refresh_event(&mut self, event_id: &str) -> bool {
        let mut changed = self.refresh_built(event_id);
        if let Some(next) = &mut self.next {
            changed |= next.refresh_event(event_id);
        }
        if let Some(prev) = &mut self.prev {
            changed |= prev.refresh_event(event_id);
        }
        changed
    }

    /// Close the subtree in the requested directions.
    pub fn close(&mut self, close_next: bool, close_prev: bool) {
        if close_next && let Some(mut next) = self.next.take() {
            next.close(true, false);
        }
        if close_prev && let Some(mut prev) = self.prev.take() {
            prev.close(false, true);
        }
    }

    fn child_mut(&mut self, direction: Direction) -> &mut Option<Box<TimelineChunk<S>>> {
        match direction {
            Direction::Forwards => &mut self.next,
            Direction::Backwards => &mut self.prev,
        }
    }

    /// Pull up to `count` events past the cursor out of the store.
    fn load_from_store(&mut self, count: usize, direction: Direction) -> Result<usize, StoreError> {
        let cursor = self.next_cursor(direction)?;
        let events = self.ctx.store.events_in_chunk(
            &self.ctx.room_id,
            self.chunk_id,
            cursor,
            direction,
            count,
        )?;
        if events.is_empty() {
            return Ok(0);
        }

        let items: Vec<TimelineItem> =
            events.iter().filter_map(|stored| self.observe_and_build(stored)).collect();
        match direction {
            // Items arrive oldest-first; inserting each at the front keeps
            // the window newest-first.
            Direction::Forwards => {
                for item in items {
                    self.built.insert(0, item);
                }
            },
            Direction::Backwards => self.built.extend(items),
        }
        Ok(events.len())
    }

    /// Display-index cursor for the next store read, inclusive.
    fn next_cursor(&self, direction: Direction) -> Result<Option<i64>, StoreError> {
        if self.built.is_empty() {
            if let Some(initial) = &self.initial_event_id
                && let Some(stored) = self.ctx.store.event(&self.ctx.room_id, initial)?
            {
                return Ok(Some(stored.display_index));
            }
            return Ok(None);
        }
        Ok(match direction {
            Direction::Forwards => self.built.first().map(|item| item.display_index + 1),
            Direction::Backwards => self.built.last().map(|item| item.display_index - 1),
        })
    }

    /// Build an item, reporting echo retirement and queueing decryption.
    fn observe_and_build(&self, stored: &StoredEvent) -> Option<TimelineItem> {
        if let Some(transaction_id) = stored.event.transaction_id() {
            self.ctx.echoes.on_synced_event(Some(transaction_id));
            if let Err(error) =
                self.ctx.store.remove_sending_event(&self.ctx.room_id, transaction_id)
            {
                tracing::debug!(%error, "failed to drop sending entry");
            }
        }
        if stored.needs_decryption() {
            self.ctx.decryptor.request_decryption(DecryptionRequest {
                event: stored.event.clone(),
                room_id: self.ctx.room_id.clone(),
                timeline_id: self.ctx.timeline_id.clone(),
            });
        }
        if !self.ctx.filters.allows(&stored.event) {
            return None;
        }

        let mut item = TimelineItem::from_stored(stored);
        if self.ctx.use_live_sender_info
            && let Ok(Some(content)) =
                self.ctx.store.member_content(&self.ctx.room_id, &stored.event.sender)
        {
            item.sender_display_name = content.display_name;
            item.sender_avatar_url = content.avatar_url;
        }
        self.ctx.echoes.decorate_with_reaction_echo(&mut item);
        Some(item)
    }

    async fn fetch_from_server(
        &mut self,
        token: String,
        count: usize,
        direction: Direction,
    ) -> LoadMoreOutcome {
        let mut token = token;
        for _ in 0..MAX_EMPTY_PAGE_RETRIES {
            let page = match self
                .ctx
                .paginator
                .messages(&self.ctx.room_id, &token, direction, count as u32, &self.ctx.filters)
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!(chunk = %self.chunk_id, %error, "pagination fetch failed");
                    return LoadMoreOutcome::Failure;
                },
            };

            match self.ctx.persistor.insert_page(&self.ctx.room_id, &page, direction) {
                Ok(InsertOutcome::Success) => {
                    if let Err(error) = self.load_from_store(count, direction) {
                        tracing::warn!(%error, "store load after fetch failed");
                    }
                    return LoadMoreOutcome::Success;
                },
                Ok(InsertOutcome::ReachedEnd) => return LoadMoreOutcome::ReachedEnd,
                Ok(InsertOutcome::ShouldFetchMore) => {
                    // The chunk's edge token moved; pick it up and go again.
                    match self.ctx.store.chunk(&self.ctx.room_id, self.chunk_id) {
                        Ok(Some(record)) => match record.token_toward(direction) {
                            Some(fresh) => token = fresh.to_owned(),
                            None if record.is_last_in(direction) => {
                                return LoadMoreOutcome::ReachedEnd;
                            },
                            None => return LoadMoreOutcome::Failure,
                        },
                        _ => return LoadMoreOutcome::Failure,
                    }
                },
                Err(error) => {
                    tracing::warn!(chunk = %self.chunk_id, %error, "page persist failed");
                    return LoadMoreOutcome::Failure;
                },
            }
        }
        tracing::warn!(chunk = %self.chunk_id, "empty-page retry budget exhausted");
        LoadMoreOutcome::Failure
    }

    /// Recover a forward token for a formerly-live chunk.
    ///
    /// The chunk lost its live flag to a newer chunk and carries no
    /// `next_token`; the context of its newest event supplies one.
    async fn resolve_token_and_fetch(
        &mut self,
        record: &ChunkRecord,
        count: usize,
        direction: Direction,
    ) -> LoadMoreOutcome {
        let Some(newest) = record.event_ids.last().cloned() else {
            return LoadMoreOutcome::Failure;
        };
        let page = match self
            .ctx
            .paginator
            .context_of_event(&self.ctx.room_id, &newest, count as u32, &self.ctx.filters)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!(event = %newest, %error, "token resolution failed");
                return LoadMoreOutcome::Failure;
            },
        };
        if let Err(error) = self.ctx.persistor.insert_context_page(&self.ctx.room_id, &page) {
            tracing::warn!(%error, "context persist failed");
            return LoadMoreOutcome::Failure;
        }

        match self.ctx.store.chunk(&self.ctx.room_id, self.chunk_id) {
            Ok(Some(refreshed)) => match refreshed.token_toward(direction) {
                Some(token) => {
                    let token = token.to_owned();
                    self.fetch_from_server(token, count, direction).await
                },
                None => LoadMoreOutcome::Failure,
            },
            _ => LoadMoreOutcome::Failure,
        }
    }

    /// Splice freshly inserted chunk events into the built window.
    fn splice_inserted(&mut self, event_ids: &[String]) -> bool {
        let mut changed = false;
        for event_id in event_ids {
            if self.built.iter().any(|item| &item.event_id == event_id) {
                continue;
            }
            let Ok(Some(stored)) = self.ctx.store.event(&self.ctx.room_id, event_id) else {
                continue;
            };
            // Below the loaded window: left for backward pagination.
            if let Some(bottom) = self.built.last().map(|item| item.display_index)
                && stored.display_index < bottom
            {
                continue;
            }
            let Some(item) = self.observe_and_build(&stored) else { continue };
            let position = self
                .built
                .iter()
                .position(|existing| existing.display_index < item.display_index)
                .unwrap_or(self.built.len());
            self.built.insert(position, item);
            changed = true;
        }
        changed
    }

    /// Rebuild the slot holding `event_id`, removing it when the rebuild
    /// filters it out.
    fn refresh_built(&mut self, event_id: &str) -> bool {
        let Some(position) = self.built.iter().position(|item| item.event_id == event_id) else {
            return false;
        };
        match self.ctx.store.event(&self.ctx.room_id, event_id) {
            Ok(Some(stored)) => {
                match self.observe_and_build(&stored) {
                    Some(item) => self.built[position] = item,
                    None => {
                        self.built.remove(position);
                    },
                }
                true
            },
            _ => false,
        }
    }

    /// Adopt the surviving chunk after this wrapper's chunk was absorbed.
    fn reanchor(&mut self) {
        let Some(anchor) = self.built.first().map(|item| item.event_id.clone()) else {
            return;
        };
        if let Ok(Some(survivor)) = self.ctx.store.chunk_containing(&self.ctx.room_id, &anchor) {
            tracing::debug!(from = %self.chunk_id, to = %survivor.id, "re-anchoring after merge");
            self.chunk_id = survivor.id;
        }
    }

    /// Collapse children that re-anchored onto this wrapper's own chunk.
    fn prune_children(&mut self) {
        if self.next.as_ref().is_some_and(|child| child.chunk_id == self.chunk_id)
            && let Some(child) = self.next.take()
        {
            self.absorb_built(*child);
        }
        if self.prev.as_ref().is_some_and(|child| child.chunk_id == self.chunk_id)
            && let Some(child) = self.prev.take()
        {
            self.absorb_built(*child);
        }
    }

    fn absorb_built(&mut self, child: TimelineChunk<S>) {
        for item in child.built {
            if self.built.iter().any(|existing| existing.event_id == item.event_id) {
                continue;
            }
            let position = self
                .built
                .iter()
                .position(|existing| existing.display_index < item.display_index)
                .unwrap_or(self.built.len());
            self.built.insert(position, item);
        }
    }
}
