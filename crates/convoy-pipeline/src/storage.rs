//! Storage gateway contract.
//!
//! The core never persists directly; it hands encrypted content to this
//! gateway and consumes the resulting `messages_version`. The in-memory
//! implementation backs tests and single-node runs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("user not found: {0}")]
    UserNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One persisted assistant message. Content arrives already encrypted with
/// the chat key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub client_message_id: String,
    pub chat_id: String,
    pub hashed_user_id: String,
    pub sender_name: String,
    pub encrypted_content: String,
    pub created_at: i64,
}

/// The user record as the storage layer knows it (credits already
/// decrypted by the real gateway).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub vault_key_id: Option<String>,
    pub credits: i64,
    pub auto_topup_enabled: bool,
    pub has_payment_method: bool,
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Persist an assistant message and return the chat's new
    /// `messages_version`.
    async fn persist_assistant_message(&self, message: &PersistedMessage) -> Result<u64>;

    /// Persist a rejection system notice (plaintext template text).
    async fn persist_system_notice(
        &self,
        chat_id: &str,
        message_id: &str,
        hashed_user_id: &str,
        text: &str,
    ) -> Result<()>;

    /// Fetch a user record for cache warming.
    async fn fetch_user_record(&self, user_id: &str) -> Result<Option<UserRecord>>;

    /// Kick off a low-balance auto top-up for the user.
    async fn trigger_auto_topup(&self, user_id: &str) -> Result<()>;
}

/// In-memory storage for tests and self-hosted single-node runs.
#[derive(Default)]
pub struct MemoryStorage {
    messages: DashMap<String, Vec<PersistedMessage>>,
    notices: DashMap<String, Vec<String>>,
    versions: DashMap<String, u64>,
    users: DashMap<String, UserRecord>,
    /// Credits granted by a simulated top-up.
    topup_amount: i64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            topup_amount: 100,
            ..Default::default()
        }
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.users.insert(user.user_id.clone(), user);
    }

    pub fn messages_for(&self, chat_id: &str) -> Vec<PersistedMessage> {
        self.messages
            .get(chat_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn notices_for(&self, chat_id: &str) -> Vec<String> {
        self.notices
            .get(chat_id)
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    pub fn version_of(&self, chat_id: &str) -> u64 {
        self.versions.get(chat_id).map(|v| *v).unwrap_or(0)
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn persist_assistant_message(&self, message: &PersistedMessage) -> Result<u64> {
        self.messages
            .entry(message.chat_id.clone())
            .or_default()
            .push(message.clone());
        let mut version = self.versions.entry(message.chat_id.clone()).or_insert(0);
        *version += 1;
        Ok(*version)
    }

    async fn persist_system_notice(
        &self,
        chat_id: &str,
        _message_id: &str,
        _hashed_user_id: &str,
        text: &str,
    ) -> Result<()> {
        self.notices
            .entry(chat_id.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn fetch_user_record(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn trigger_auto_topup(&self, user_id: &str) -> Result<()> {
        match self.users.get_mut(user_id) {
            Some(mut user) if user.auto_topup_enabled && user.has_payment_method => {
                user.credits += self.topup_amount;
                Ok(())
            }
            Some(_) => Err(StorageError::Backend(
                "auto top-up not enabled or no payment method".to_string(),
            )),
            None => Err(StorageError::UserNotFound(user_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_bumps_version_per_chat() {
        let storage = MemoryStorage::new();
        let msg = PersistedMessage {
            client_message_id: "t1".into(),
            chat_id: "c1".into(),
            hashed_user_id: "h".into(),
            sender_name: "assistant".into(),
            encrypted_content: "enc".into(),
            created_at: 0,
        };
        assert_eq!(storage.persist_assistant_message(&msg).await.unwrap(), 1);
        assert_eq!(storage.persist_assistant_message(&msg).await.unwrap(), 2);
        assert_eq!(storage.version_of("c1"), 2);
        assert_eq!(storage.version_of("other"), 0);
    }

    #[tokio::test]
    async fn topup_requires_payment_method() {
        let storage = MemoryStorage::new();
        storage.insert_user(UserRecord {
            user_id: "u1".into(),
            vault_key_id: None,
            credits: 0,
            auto_topup_enabled: true,
            has_payment_method: false,
        });
        assert!(storage.trigger_auto_topup("u1").await.is_err());

        storage.insert_user(UserRecord {
            user_id: "u2".into(),
            vault_key_id: None,
            credits: 0,
            auto_topup_enabled: true,
            has_payment_method: true,
        });
        storage.trigger_auto_topup("u2").await.unwrap();
        let user = storage.fetch_user_record("u2").await.unwrap().unwrap();
        assert_eq!(user.credits, 100);
    }
}
