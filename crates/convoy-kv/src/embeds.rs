//! Embed status index.
//!
//! Embed content lives elsewhere; the core only tracks status so dangling
//! `processing` embeds can be transitioned on failure.

use std::sync::Arc;

use convoy_core::types::{EmbedRecord, EmbedStatus};

use crate::error::{KvError, Result};
use crate::keys;
use crate::store::KvStore;

#[derive(Clone)]
pub struct EmbedIndex {
    store: Arc<dyn KvStore>,
}

impl EmbedIndex {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn put(&self, record: &EmbedRecord) -> Result<()> {
        let key = keys::embed(&record.embed_id);
        let encoded = serde_json::to_string(record).map_err(|e| KvError::Decode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &encoded).await
    }

    pub async fn get(&self, embed_id: &str) -> Result<Option<EmbedRecord>> {
        let key = keys::embed(embed_id);
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

    /// Every decodable embed record. Undecodable entries are skipped.
    pub async fn scan(&self) -> Result<Vec<EmbedRecord>> {
        let mut records = Vec::new();
        for key in self.store.scan_prefix(keys::EMBED_PREFIX).await? {
            if let Some(raw) = self.store.get(&key).await? {
                match serde_json::from_str::<EmbedRecord>(&raw) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "skipping undecodable embed record")
                    }
                }
            }
        }
        Ok(records)
    }

    pub async fn update_status(
        &self,
        embed_id: &str,
        status: EmbedStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        if let Some(mut record) = self.get(embed_id).await? {
            record.status = status;
            record.error_message = error_message;
            self.put(&record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn record(id: &str, status: EmbedStatus) -> EmbedRecord {
        EmbedRecord {
            embed_id: id.into(),
            app_id: "images".into(),
            skill_id: "generate".into(),
            status,
            hashed_chat_id: "hc".into(),
            hashed_task_id: "ht".into(),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn put_scan_update() {
        let index = EmbedIndex::new(Arc::new(MemoryStore::new()));
        index.put(&record("e1", EmbedStatus::Processing)).await.unwrap();
        index.put(&record("e2", EmbedStatus::Ok)).await.unwrap();

        let all = index.scan().await.unwrap();
        assert_eq!(all.len(), 2);

        index
            .update_status("e1", EmbedStatus::Error, Some("boom".into()))
            .await
            .unwrap();
        let e1 = index.get("e1").await.unwrap().unwrap();
        assert_eq!(e1.status, EmbedStatus::Error);
        assert_eq!(e1.error_message.as_deref(), Some("boom"));
    }
}
