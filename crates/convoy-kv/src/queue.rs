//! Per-chat message queue.
//!
//! Producers (the transport layer) append when a chat already has an active
//! pipeline; only the pipeline holding the active marker drains.

use std::sync::Arc;

use tracing::warn;

use convoy_core::types::QueuedMessage;

use crate::error::Result;
use crate::keys;
use crate::store::KvStore;

#[derive(Clone)]
pub struct ChatQueues {
    store: Arc<dyn KvStore>,
}

impl ChatQueues {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn push(&self, chat_id: &str, message: &QueuedMessage) -> Result<usize> {
        let encoded = serde_json::to_string(message).map_err(|e| {
            crate::error::KvError::Decode {
                key: keys::chat_queue(chat_id),
                reason: e.to_string(),
            }
        })?;
        self.store.list_push(&keys::chat_queue(chat_id), &encoded).await
    }

    /// Read and delete the whole queue. Malformed entries are skipped with a
    /// warning rather than poisoning the drain.
    pub async fn drain(&self, chat_id: &str) -> Result<Vec<QueuedMessage>> {
        let raw = self.store.list_drain(&keys::chat_queue(chat_id)).await?;
        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<QueuedMessage>(&entry) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(chat_id, error = %e, "skipping malformed queued message"),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use convoy_core::types::{AskRequest, HistoryMessage, MessageContent, Role};
    use std::collections::BTreeMap;

    fn request(chat_id: &str, text: &str) -> AskRequest {
        AskRequest {
            chat_id: chat_id.into(),
            message_id: format!("m-{text}"),
            user_id: "u".into(),
            user_id_hash: "h".into(),
            message_history: vec![HistoryMessage {
                role: Role::User,
                content: MessageContent::Text(text.into()),
                created_at: 0,
                sender_name: None,
                category: None,
            }],
            chat_has_title: true,
            is_incognito: false,
            is_external: false,
            mate_id: None,
            active_focus_id: None,
            user_preferences: BTreeMap::new(),
            app_settings_memories_metadata: None,
        }
    }

    #[tokio::test]
    async fn drain_preserves_arrival_order_and_empties() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let queues = ChatQueues::new(Arc::clone(&store));

        queues.push("c2", &request("c2", "one")).await.unwrap();
        queues.push("c2", &request("c2", "two")).await.unwrap();

        let drained = queues.drain("c2").await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0].last_user_message_text().as_deref(),
            Some("one")
        );
        assert_eq!(
            drained[1].last_user_message_text().as_deref(),
            Some("two")
        );
        assert!(queues.drain("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let queues = ChatQueues::new(Arc::clone(&store));

        store
            .list_push(&keys::chat_queue("c3"), "not json")
            .await
            .unwrap();
        queues.push("c3", &request("c3", "ok")).await.unwrap();

        let drained = queues.drain("c3").await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].last_user_message_text().as_deref(), Some("ok"));
    }
}
