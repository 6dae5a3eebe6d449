//! Per-invocation skill cancellation flags.
//!
//! Cancellation is per `skill_task_id`, never per user or per turn: the
//! main response continues with whatever results are available.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::keys;
use crate::store::KvStore;

/// Skills should complete well before this.
const CANCELLED_SKILL_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct CancellationFlags {
    store: Arc<dyn KvStore>,
}

impl CancellationFlags {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn cancel(&self, skill_task_id: &str) -> Result<()> {
        self.store
            .set_ex(
                &keys::cancelled_skill(skill_task_id),
                "cancelled",
                CANCELLED_SKILL_TTL,
            )
            .await?;
        info!(skill_task_id, "marked skill invocation cancelled");
        Ok(())
    }

    pub async fn is_cancelled(&self, skill_task_id: &str) -> bool {
        // A failed flag read must not kill the skill call.
        match self.store.get(&keys::cancelled_skill(skill_task_id)).await {
            Ok(flag) => flag.is_some(),
            Err(e) => {
                tracing::debug!(skill_task_id, error = %e, "cancellation check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn cancel_flag_roundtrip() {
        let flags = CancellationFlags::new(Arc::new(MemoryStore::new()));
        assert!(!flags.is_cancelled("s1").await);
        flags.cancel("s1").await.unwrap();
        assert!(flags.is_cancelled("s1").await);
        assert!(!flags.is_cancelled("s2").await);
    }
}
