//! In-process store backend.
//!
//! A DashMap with per-entry expiry, checked lazily on access. This backs
//! single-node deployments and every test; a networked store slots in
//! behind the same [`KvStore`] trait for multi-worker deployments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{KvError, Result};
use crate::store::KvStore;

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Counter(i64),
    List(Vec<String>),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<Slot> {
        let entry = self.entries.get(key)?;
        if entry.live() {
            Some(entry.slot.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.read(key) {
            Some(Slot::Text(s)) => Some(s),
            Some(Slot::Counter(n)) => Some(n.to_string()),
            Some(Slot::List(_)) | None => None,
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Counter(0),
            expires_at: Some(Instant::now() + ttl),
        });
        if !entry.live() {
            entry.slot = Slot::Counter(0);
        }
        let next = match &entry.slot {
            Slot::Counter(n) => n + 1,
            Slot::Text(s) => s.parse::<i64>().map_err(|_| KvError::Decode {
                key: key.to_string(),
                reason: "value is not an integer".to_string(),
            })? + 1,
            Slot::List(_) => {
                return Err(KvError::Decode {
                    key: key.to_string(),
                    reason: "cannot increment a list".to_string(),
                })
            }
        };
        entry.slot = Slot::Counter(next);
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(next)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::List(Vec::new()),
            expires_at: None,
        });
        if !entry.live() {
            entry.slot = Slot::List(Vec::new());
            entry.expires_at = None;
        }
        match &mut entry.slot {
            Slot::List(items) => {
                items.push(value.to_string());
                Ok(items.len())
            }
            _ => Err(KvError::Decode {
                key: key.to_string(),
                reason: "key does not hold a list".to_string(),
            }),
        }
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<String>> {
        match self.entries.remove(key) {
            Some((_, entry)) if entry.live() => match entry.slot {
                Slot::List(items) => Ok(items),
                _ => Err(KvError::Decode {
                    key: key.to_string(),
                    reason: "key does not hold a list".to_string(),
                }),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().live())
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_creates_and_counts() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(2);
        assert_eq!(store.incr_and_expire("c", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_and_expire("c", ttl).await.unwrap(), 2);
        assert_eq!(store.incr_and_expire("c", ttl).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn list_push_then_drain_empties() {
        let store = MemoryStore::new();
        store.list_push("q", "a").await.unwrap();
        store.list_push("q", "b").await.unwrap();
        assert_eq!(store.list_drain("q").await.unwrap(), vec!["a", "b"]);
        assert!(store.list_drain("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_prefix_skips_expired() {
        let store = MemoryStore::new();
        store.set("embed:1", "x").await.unwrap();
        store
            .set_ex("embed:2", "y", Duration::from_millis(5))
            .await
            .unwrap();
        store.set("other:3", "z").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut keys = store.scan_prefix("embed:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["embed:1"]);
    }
}
