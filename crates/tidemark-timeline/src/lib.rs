//! Client-side timeline engine for the Tidemark workspace.
//!
//! Orchestrates the pieces a gap-tolerant, decrypting room timeline needs:
//! the in-memory chunk tree over the persisted chunk graph, the UI echo
//! reconciler for optimistic local events, the single-consumer decryption
//! queue with retry-on-new-key semantics, and the timeline façade that
//! owns pagination state and publishes immutable snapshots.
//!
//! External collaborators plug in through three traits: [`PaginationApi`]
//! (the remote history endpoints), [`EventDecryptor`] and
//! [`SessionKeyBank`] (the key-management boundary), and the
//! `TimelineStore` substrate from `tidemark-core`.

mod api;
mod chunk_tree;
mod decrypt;
mod echo;
mod error;
mod item;
mod strategy;
mod timeline;

pub use api::{ApiError, PaginationApi};
pub use chunk_tree::LoadMoreOutcome;
pub use decrypt::{
    CryptoError, DecryptionQueue, DecryptionRequest, EventDecryptor, NewSessionKey,
    SessionKeyBank,
};
pub use echo::UiEchoReconciler;
pub use error::TimelineError;
pub use item::TimelineItem;
pub use strategy::TimelineMode;
pub use timeline::{PaginationState, Timeline, TimelineSettings, TimelineSignal};
