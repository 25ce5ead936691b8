//! Wire-facing data model for the Tidemark timeline engine.
//!
//! This crate defines the types consumed from the remote pagination API and
//! shared across the engine: the event envelope, pagination pages and their
//! opaque tokens, the pagination direction, and the room event filter.
//!
//! Nothing here touches persistence or networking. The types are plain
//! serde-derived data so that higher layers (store, persistor, timeline) can
//! agree on a single vocabulary without depending on each other.

mod direction;
mod event;
mod filter;
mod page;

pub use direction::Direction;
pub use event::{
    EncryptionInfo, Event, EventError, EventKind, MembershipContent, Relation, RelationKind,
    UnsignedData,
};
pub use filter::RoomEventFilter;
pub use page::Page;
