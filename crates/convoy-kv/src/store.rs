//! The shared key/value store behind rate counters, active-task markers,
//! per-chat queues, cancellation flags, and embed status.
//!
//! All mutations are per-key atomic (INCR+EXPIRE, SETEX, DEL). Components
//! never touch keys directly — they go through the typed facades in this
//! crate.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// SETEX: set with a time-to-live.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns true when the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically increment a counter (creating it at 1) and refresh its
    /// TTL. Returns the new value.
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Append to a list, returning the new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<usize>;

    /// Atomically read the whole list and delete it.
    async fn list_drain(&self, key: &str) -> Result<Vec<String>>;

    /// All live keys with the given prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
