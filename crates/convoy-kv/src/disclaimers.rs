//! Per-chat record of the last advice disclaimer shown.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};
use crate::keys;
use crate::store::KvStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisclaimerRecord {
    pub last_disclaimer_type: Option<String>,
    pub last_disclaimer_timestamp: Option<i64>,
}

#[derive(Clone)]
pub struct DisclaimerLog {
    store: Arc<dyn KvStore>,
}

impl DisclaimerLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read the record. Decode failures are errors so the caller can apply
    /// its fail-safe (inject the disclaimer).
    pub async fn last(&self, chat_id: &str) -> Result<Option<DisclaimerRecord>> {
        let key = keys::chat_list_item_data(chat_id);
        match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| KvError::Decode {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn record(&self, chat_id: &str, disclaimer_type: &str, now: i64) -> Result<()> {
        let key = keys::chat_list_item_data(chat_id);
        let record = DisclaimerRecord {
            last_disclaimer_type: Some(disclaimer_type.to_string()),
            last_disclaimer_timestamp: Some(now),
        };
        let encoded = serde_json::to_string(&record).map_err(|e| KvError::Decode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn record_then_read() {
        let log = DisclaimerLog::new(Arc::new(MemoryStore::new()));
        assert!(log.last("c1").await.unwrap().is_none());
        log.record("c1", "medical", 1_700_000_000).await.unwrap();
        let rec = log.last("c1").await.unwrap().unwrap();
        assert_eq!(rec.last_disclaimer_type.as_deref(), Some("medical"));
        assert_eq!(rec.last_disclaimer_timestamp, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn garbage_record_is_a_decode_error() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store
            .set(&keys::chat_list_item_data("c2"), "{{{")
            .await
            .unwrap();
        let log = DisclaimerLog::new(store);
        assert!(log.last("c2").await.is_err());
    }
}
