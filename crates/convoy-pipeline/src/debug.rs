//! Encrypted per-user ring of recent pipeline stage snapshots.
//!
//! Operators replay incidents from these: full inputs/outputs per stage,
//! last 10 per user, 30-minute TTL, encrypted with the user's debug key.
//! Recording failure never fails the request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use convoy_kv::{keys, KvStore};

use crate::secrets::{CipherService, SecretsGateway};

const RING_SIZE: usize = 10;
const RING_TTL: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocessor,
    MainProcessor,
    Postprocessor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugRecord {
    pub task_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub stage: Stage,
    pub input_snapshot: Value,
    pub output_snapshot: Value,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct DebugRecorder {
    store: Arc<dyn KvStore>,
    secrets: Arc<dyn SecretsGateway>,
}

impl DebugRecorder {
    pub fn new(store: Arc<dyn KvStore>, secrets: Arc<dyn SecretsGateway>) -> Self {
        Self { store, secrets }
    }

    /// Append a stage record to the user's ring. Logs and returns on any
    /// failure.
    pub async fn record(
        &self,
        task_id: &str,
        chat_id: &str,
        user_id: &str,
        stage: Stage,
        input_snapshot: Value,
        output_snapshot: Value,
    ) {
        let record = DebugRecord {
            task_id: task_id.to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            stage,
            input_snapshot,
            output_snapshot,
            timestamp: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = self.append(user_id, record).await {
            warn!(task_id, user_id, error = %e, "debug recording failed (non-fatal)");
        }
    }

    /// Decrypt and return the user's ring, newest last.
    pub async fn read_ring(&self, user_id: &str) -> Vec<DebugRecord> {
        match self.load(user_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!(user_id, error = %e, "debug ring read failed");
                Vec::new()
            }
        }
    }

    async fn append(&self, user_id: &str, record: DebugRecord) -> Result<(), String> {
        let mut ring = self.load(user_id).await.unwrap_or_default();
        ring.push(record);
        if ring.len() > RING_SIZE {
            let excess = ring.len() - RING_SIZE;
            ring.drain(..excess);
        }

        let key = self
            .secrets
            .user_debug_key(user_id)
            .await
            .map_err(|e| e.to_string())?;
        let plaintext = serde_json::to_vec(&ring).map_err(|e| e.to_string())?;
        let encrypted = CipherService::encrypt(&key, &plaintext).map_err(|e| e.to_string())?;
        self.store
            .set_ex(&keys::debug_requests(user_id), &encrypted, RING_TTL)
            .await
            .map_err(|e| e.to_string())
    }

    async fn load(&self, user_id: &str) -> Result<Vec<DebugRecord>, String> {
        let Some(encrypted) = self
            .store
            .get(&keys::debug_requests(user_id))
            .await
            .map_err(|e| e.to_string())?
        else {
            return Ok(Vec::new());
        };
        let key = self
            .secrets
            .user_debug_key(user_id)
            .await
            .map_err(|e| e.to_string())?;
        let plaintext = CipherService::decrypt(&key, &encrypted).map_err(|e| e.to_string())?;
        serde_json::from_slice(&plaintext).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecrets;
    use convoy_kv::MemoryStore;
    use serde_json::json;

    fn recorder() -> DebugRecorder {
        DebugRecorder::new(
            Arc::new(MemoryStore::new()),
            Arc::new(StaticSecrets::from_passphrase("test")),
        )
    }

    #[tokio::test]
    async fn records_are_recovered_in_order() {
        let recorder = recorder();
        recorder
            .record("t1", "c1", "u1", Stage::Preprocessor, json!({"a": 1}), json!({}))
            .await;
        recorder
            .record("t1", "c1", "u1", Stage::MainProcessor, json!({}), json!({"text": "x"}))
            .await;

        let ring = recorder.read_ring("u1").await;
        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0].stage, Stage::Preprocessor);
        assert_eq!(ring[1].stage, Stage::MainProcessor);
        assert_eq!(ring[1].output_snapshot["text"], "x");
    }

    #[tokio::test]
    async fn ring_keeps_only_last_ten() {
        let recorder = recorder();
        for i in 0..13 {
            recorder
                .record(
                    &format!("t{i}"),
                    "c1",
                    "u1",
                    Stage::Preprocessor,
                    json!({"i": i}),
                    json!({}),
                )
                .await;
        }
        let ring = recorder.read_ring("u1").await;
        assert_eq!(ring.len(), 10);
        assert_eq!(ring[0].input_snapshot["i"], 3);
        assert_eq!(ring[9].input_snapshot["i"], 12);
    }

    #[tokio::test]
    async fn stored_payload_is_not_plaintext() {
        let recorder = recorder();
        recorder
            .record("t1", "c1", "u2", Stage::Preprocessor, json!({"secret": "visible?"}), json!({}))
            .await;
        let raw = recorder
            .store
            .get(&keys::debug_requests("u2"))
            .await
            .unwrap()
            .unwrap();
        assert!(!raw.contains("visible?"));
    }

    #[tokio::test]
    async fn rings_are_per_user() {
        let recorder = recorder();
        recorder
            .record("t1", "c1", "alice", Stage::Preprocessor, json!({}), json!({}))
            .await;
        assert!(recorder.read_ring("bob").await.is_empty());
    }
}
