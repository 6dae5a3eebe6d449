//! Typed interfaces over the shared key/value store.
//!
//! Rate counters, active-task markers, per-chat queues, cancellation
//! flags, disclaimer records, embed status, and the cached user record all
//! live behind facades here; no component formats keys by hand.

pub mod cancel;
pub mod disclaimers;
pub mod embeds;
pub mod error;
pub mod keys;
pub mod markers;
pub mod memory;
pub mod queue;
pub mod store;
pub mod users;

pub use cancel::CancellationFlags;
pub use disclaimers::{DisclaimerLog, DisclaimerRecord};
pub use embeds::EmbedIndex;
pub use error::{KvError, Result};
pub use markers::ActiveTaskMarkers;
pub use memory::MemoryStore;
pub use queue::ChatQueues;
pub use store::KvStore;
pub use users::{CachedUser, UserCache};
