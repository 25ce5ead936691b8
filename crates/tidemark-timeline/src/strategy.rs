//! Timeline load strategies.
//!
//! A strategy anchors the chunk tree for one of the three operating modes:
//! live edge, permalink, or thread scope. The façade swaps strategies when
//! the mode changes; each swap closes the previous tree.

use tidemark_core::{StoreChange, TimelineStore};
use tidemark_proto::Direction;

use crate::{
    api::ApiError,
    chunk_tree::{ChunkContext, LoadMoreOutcome, TimelineChunk},
    error::TimelineError,
    item::TimelineItem,
};

/// Anchoring mode of a timeline instance. Modes are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineMode {
    /// Anchored to the room's live/forward edge.
    Live,
    /// Anchored to a specific historical event.
    Permalink {
        /// The anchor event id.
        event_id: String,
    },
    /// Anchored to a thread root with its own isolated forward chunk.
    Thread {
        /// The thread root event id.
        root_event_id: String,
    },
}

pub(crate) struct LoadStrategy<S: TimelineStore> {
    ctx: ChunkContext<S>,
    mode: TimelineMode,
    context_limit: u32,
    root: Option<TimelineChunk<S>>,
}

impl<S: TimelineStore> LoadStrategy<S> {
    pub fn new(ctx: ChunkContext<S>, mode: TimelineMode, context_limit: u32) -> Self {
        Self { ctx, mode, context_limit, root: None }
    }

    pub fn mode(&self) -> &TimelineMode {
        &self.mode
    }

    /// Anchor the chunk tree for the current mode.
    pub async fn start(&mut self) -> Result<(), TimelineError> {
        let mode = self.mode.clone();
        let root = match mode {
            TimelineMode::Live => {
                let chunk = self.ctx.persistor.ensure_live_chunk(&self.ctx.room_id, None)?;
                TimelineChunk::new(self.ctx.clone(), chunk.id, None)
            },
            TimelineMode::Permalink { event_id } => {
                let chunk_id = match self
                    .ctx
                    .store
                    .chunk_containing(&self.ctx.room_id, &event_id)?
                {
                    Some(chunk) => chunk.id,
                    None => {
                        // Not locally known: resolve through a context fetch.
                        let page = self
                            .ctx
                            .paginator
                            .context_of_event(
                                &self.ctx.room_id,
                                &event_id,
                                self.context_limit,
                                &self.ctx.filters,
                            )
                            .await
                            .map_err(|error| match error {
                                ApiError::Network(reason) => TimelineError::Network(reason),
                                ApiError::NotFound | ApiError::Forbidden => {
                                    TimelineError::PermalinkUnresolved {
                                        event_id: event_id.clone(),
                                        reason: error.to_string(),
                                    }
                                },
                            })?;
                        self.ctx.persistor.insert_context_page(&self.ctx.room_id, &page)?
                    },
                };
                TimelineChunk::new(self.ctx.clone(), chunk_id, Some(event_id))
            },
            TimelineMode::Thread { root_event_id } => {
                // Always a fresh chunk: stale thread state is cleared on
                // every (re-)entry.
                let chunk =
                    self.ctx.persistor.reset_thread_chunk(&self.ctx.room_id, &root_event_id)?;
                TimelineChunk::new(self.ctx.clone(), chunk.id, None)
            },
        };
        self.root = Some(root);
        Ok(())
    }

    /// Close the tree; thread scopes also clear their isolated chunk.
    pub fn stop(&mut self) {
        if let Some(mut root) = self.root.take() {
            root.close(true, true);
        }
        if let TimelineMode::Thread { root_event_id } = &self.mode
            && let Err(error) =
                self.ctx.persistor.clear_thread_chunk(&self.ctx.room_id, root_event_id)
        {
            tracing::warn!(%error, "failed to clear thread chunk on stop");
        }
    }

    pub async fn load_more(&mut self, count: usize, direction: Direction) -> LoadMoreOutcome {
        match &mut self.root {
            Some(root) => root.load_more(count, direction).await,
            None => LoadMoreOutcome::Failure,
        }
    }

    pub fn handle_store_change(&mut self, change: &StoreChange) -> bool {
        self.root.as_mut().is_some_and(|root| root.handle_store_change(change))
    }

    pub fn refresh_event(&mut self, event_id: &str) -> bool {
        self.root.as_mut().is_some_and(|root| root.refresh_event(event_id))
    }

    /// The built window across the whole materialized tree, newest first.
    pub fn build_window(&self) -> Vec<TimelineItem> {
        self.root.as_ref().map_or_else(Vec::new, |root| root.built_items(true, true))
    }
}
