//! Cached user records for the credit gate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};
use crate::keys;
use crate::store::KvStore;

const USER_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedUser {
    pub user_id: String,
    pub vault_key_id: Option<String>,
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub auto_topup_enabled: bool,
    #[serde(default)]
    pub has_payment_method: bool,
}

#[derive(Clone)]
pub struct UserCache {
    store: Arc<dyn KvStore>,
}

impl UserCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<CachedUser>> {
        let key = keys::user(user_id);
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

    pub async fn set(&self, user: &CachedUser) -> Result<()> {
        let key = keys::user(&user.user_id);
        let encoded = serde_json::to_string(user).map_err(|e| KvError::Decode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set_ex(&key, &encoded, USER_CACHE_TTL).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn user_roundtrip() {
        let cache = UserCache::new(Arc::new(MemoryStore::new()));
        assert!(cache.get("u1").await.unwrap().is_none());
        cache
            .set(&CachedUser {
                user_id: "u1".into(),
                vault_key_id: Some("vk".into()),
                credits: 5,
                auto_topup_enabled: true,
                has_payment_method: false,
            })
            .await
            .unwrap();
        let user = cache.get("u1").await.unwrap().unwrap();
        assert_eq!(user.credits, 5);
        assert!(user.auto_topup_enabled);
    }
}
