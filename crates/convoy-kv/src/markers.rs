//! Active-task marker: at most one in-flight pipeline per chat.

use std::sync::Arc;

use crate::error::Result;
use crate::keys;
use crate::store::KvStore;

#[derive(Clone)]
pub struct ActiveTaskMarkers {
    store: Arc<dyn KvStore>,
}

impl ActiveTaskMarkers {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Claim the chat for a task. Returns the previous holder when one
    /// existed (callers treat that as "already active — queue instead").
    pub async fn set(&self, chat_id: &str, task_id: &str) -> Result<Option<String>> {
        let key = keys::active_ai_task(chat_id);
        let previous = self.store.get(&key).await?;
        self.store.set(&key, task_id).await?;
        Ok(previous)
    }

    pub async fn get(&self, chat_id: &str) -> Result<Option<String>> {
        self.store.get(&keys::active_ai_task(chat_id)).await
    }

    /// Returns true when a marker was actually cleared. Idempotent.
    pub async fn clear(&self, chat_id: &str) -> Result<bool> {
        self.store.del(&keys::active_ai_task(chat_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn set_get_clear_roundtrip() {
        let markers = ActiveTaskMarkers::new(Arc::new(MemoryStore::new()));
        assert_eq!(markers.set("c1", "t1").await.unwrap(), None);
        assert_eq!(markers.get("c1").await.unwrap().as_deref(), Some("t1"));
        assert_eq!(
            markers.set("c1", "t2").await.unwrap().as_deref(),
            Some("t1")
        );
        assert!(markers.clear("c1").await.unwrap());
        assert!(!markers.clear("c1").await.unwrap());
        assert_eq!(markers.get("c1").await.unwrap(), None);
    }
}
