//! Idempotent cleanup on every failure and interruption path.
//!
//! Two duties: release the per-chat active marker so the typing indicator
//! stops and new messages can start, and transition any embeds this run
//! left in `processing` so the client can render the failure. Cleanup
//! failures are logged, never raised.

use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use convoy_core::types::EmbedStatus;
use convoy_kv::{ActiveTaskMarkers, EmbedIndex};

const MAX_ERROR_LEN: usize = 256;

#[derive(Clone)]
pub struct CleanupCoordinator {
    markers: ActiveTaskMarkers,
    embeds: EmbedIndex,
}

impl CleanupCoordinator {
    pub fn new(markers: ActiveTaskMarkers, embeds: EmbedIndex) -> Self {
        Self { markers, embeds }
    }

    /// Release the marker and finalize dangling embeds for this run.
    /// `revoked` selects `cancelled` over `error` as the terminal status.
    /// Safe to call more than once per run.
    pub async fn run(&self, chat_id: &str, task_id: &str, revoked: bool, error_message: &str) {
        match self.markers.clear(chat_id).await {
            Ok(true) => info!(chat_id, task_id, "cleared active task marker"),
            Ok(false) => debug!(chat_id, task_id, "active task marker already absent"),
            Err(e) => error!(chat_id, task_id, error = %e, "failed to clear active task marker"),
        }

        let hashed_chat_id = sha256_hex(chat_id);
        let hashed_task_id = sha256_hex(task_id);

        let records = match self.embeds.scan().await {
            Ok(records) => records,
            Err(e) => {
                error!(chat_id, task_id, error = %e, "embed scan failed during cleanup");
                return;
            }
        };

        let mut transitioned = 0usize;
        for record in records {
            let dangling = record.status == EmbedStatus::Processing
                && record.hashed_chat_id == hashed_chat_id
                && record.hashed_task_id == hashed_task_id;
            if !dangling {
                continue;
            }

            let (status, message) = if revoked {
                (EmbedStatus::Cancelled, None)
            } else {
                (
                    EmbedStatus::Error,
                    Some(format!("Task failed: {}", truncate(error_message))),
                )
            };
            match self
                .embeds
                .update_status(&record.embed_id, status, message)
                .await
            {
                Ok(()) => transitioned += 1,
                Err(e) => error!(
                    embed_id = %record.embed_id,
                    error = %e,
                    "failed to transition dangling embed"
                ),
            }
        }

        if transitioned > 0 {
            info!(chat_id, task_id, transitioned, "finalized dangling embeds");
        }
    }
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_LEN).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::types::EmbedRecord;
    use convoy_kv::{KvStore, MemoryStore};
    use std::sync::Arc;

    fn coordinator() -> (CleanupCoordinator, ActiveTaskMarkers, EmbedIndex) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let markers = ActiveTaskMarkers::new(Arc::clone(&store));
        let embeds = EmbedIndex::new(Arc::clone(&store));
        (
            CleanupCoordinator::new(markers.clone(), embeds.clone()),
            markers,
            embeds,
        )
    }

    fn processing_embed(id: &str, chat_id: &str, task_id: &str) -> EmbedRecord {
        EmbedRecord {
            embed_id: id.into(),
            app_id: "images".into(),
            skill_id: "generate".into(),
            status: EmbedStatus::Processing,
            hashed_chat_id: sha256_hex(chat_id),
            hashed_task_id: sha256_hex(task_id),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn failure_marks_embeds_error_and_clears_marker() {
        let (cleanup, markers, embeds) = coordinator();
        markers.set("c1", "t1").await.unwrap();
        embeds.put(&processing_embed("e1", "c1", "t1")).await.unwrap();
        // Another run's embed stays untouched.
        embeds.put(&processing_embed("e2", "c1", "other")).await.unwrap();

        cleanup.run("c1", "t1", false, "provider exploded").await;

        assert!(markers.get("c1").await.unwrap().is_none());
        let e1 = embeds.get("e1").await.unwrap().unwrap();
        assert_eq!(e1.status, EmbedStatus::Error);
        assert!(e1.error_message.unwrap().contains("provider exploded"));
        let e2 = embeds.get("e2").await.unwrap().unwrap();
        assert_eq!(e2.status, EmbedStatus::Processing);
    }

    #[tokio::test]
    async fn revocation_marks_embeds_cancelled() {
        let (cleanup, _markers, embeds) = coordinator();
        embeds.put(&processing_embed("e1", "c2", "t2")).await.unwrap();
        cleanup.run("c2", "t2", true, "user cancelled").await;
        let e1 = embeds.get("e1").await.unwrap().unwrap();
        assert_eq!(e1.status, EmbedStatus::Cancelled);
        assert!(e1.error_message.is_none());
    }

    #[tokio::test]
    async fn second_invocation_is_a_noop() {
        let (cleanup, markers, embeds) = coordinator();
        markers.set("c3", "t3").await.unwrap();
        embeds.put(&processing_embed("e1", "c3", "t3")).await.unwrap();

        cleanup.run("c3", "t3", false, "boom").await;
        let first = embeds.get("e1").await.unwrap().unwrap();

        cleanup.run("c3", "t3", false, "boom again").await;
        let second = embeds.get("e1").await.unwrap().unwrap();

        // Already-error embeds are not reprocessed.
        assert_eq!(first.error_message, second.error_message);
        assert!(markers.get("c3").await.unwrap().is_none());
    }
}
