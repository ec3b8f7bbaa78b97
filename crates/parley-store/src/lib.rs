//! # parley-store
//!
//! In-memory stores for the Parley synchronization engine.
//!
//! Every store is a plain synchronous struct owned by a single task (the
//! engine loop); none of them locks or spawns. Conversations are indexed
//! for ordered, filtered listing, messages are kept sorted per conversation
//! with temporary-id aliasing for optimistic sends, and the typing and
//! presence trackers hold short-lived indicators.

pub mod conversations;
pub mod filter;
pub mod messages;
pub mod presence;
pub mod typing;

mod error;

pub use conversations::{ConversationIter, ConversationStore, UpsertOutcome};
pub use error::{Result, StoreError};
pub use filter::{Category, ConversationFilter, DateRange};
pub use messages::{ApplyOutcome, Draft, MessageStore};
pub use presence::{Presence, PresenceTracker};
pub use typing::TypingTracker;
