//! Persisted data model and merge logic for the Tidemark timeline engine.
//!
//! This crate owns everything that sits directly on the local store: chunk
//! records (token-delimited runs of room history), stored events with their
//! mutable decorations, the [`TimelineStore`] trait marking the persistence
//! substrate boundary, an in-memory store implementation, and the chunk
//! merge persistor that folds server pages into the chunk graph.

mod chunk;
mod error;
mod event;
pub mod persistor;
pub mod store;

pub use chunk::{ChunkId, ChunkRecord};
pub use error::StoreError;
pub use event::{
    DecryptionErrorCode, DecryptionResult, ReactionAggregate, SendState, SenderProfile,
    StoredEvent,
};
pub use persistor::{InsertOutcome, PagePersistor, MAX_CHUNK_MERGES_PER_PAGE};
pub use store::{memory::MemoryTimelineStore, StoreChange, StoreTxn, TimelineStore};
