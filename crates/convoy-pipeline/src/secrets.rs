//! Secrets gateway contract and the AEAD cipher used for chat content and
//! debug records.
//!
//! Key management (vault, key wrapping) is external; the core only asks
//! for a 32-byte key per chat or per user and encrypts with AES-256-GCM.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secrets backend error: {0}")]
    Backend(String),

    #[error("cipher failure: {0}")]
    Cipher(String),
}

pub type Result<T> = std::result::Result<T, SecretsError>;

#[async_trait]
pub trait SecretsGateway: Send + Sync {
    /// Encryption key for a chat's message content.
    async fn chat_key(&self, chat_id: &str) -> Result<[u8; 32]>;

    /// Per-user key for the encrypted debug ring.
    async fn user_debug_key(&self, user_id: &str) -> Result<[u8; 32]>;
}

/// Derives per-id keys from one master secret. Suitable for tests and
/// single-node runs; production supplies a vault-backed implementation.
pub struct StaticSecrets {
    master: [u8; 32],
}

impl StaticSecrets {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        Self {
            master: hasher.finalize().into(),
        }
    }

    fn derive(&self, scope: &str, id: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.master);
        hasher.update(scope.as_bytes());
        hasher.update(id.as_bytes());
        hasher.finalize().into()
    }
}

#[async_trait]
impl SecretsGateway for StaticSecrets {
    async fn chat_key(&self, chat_id: &str) -> Result<[u8; 32]> {
        Ok(self.derive("chat", chat_id))
    }

    async fn user_debug_key(&self, user_id: &str) -> Result<[u8; 32]> {
        Ok(self.derive("debug", user_id))
    }
}

/// AES-256-GCM with a random nonce, base64(nonce || ciphertext) on the
/// wire.
pub struct CipherService;

impl CipherService {
    pub fn encrypt(key_bytes: &[u8; 32], plaintext: &[u8]) -> Result<String> {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| SecretsError::Cipher("invalid key".to_string()))?;
        let key = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| SecretsError::Cipher("nonce generation failed".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| SecretsError::Cipher("seal failed".to_string()))?;

        let mut wire = Vec::with_capacity(NONCE_LEN + buffer.len());
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&buffer);
        Ok(BASE64.encode(wire))
    }

    pub fn decrypt(key_bytes: &[u8; 32], encoded: &str) -> Result<Vec<u8>> {
        let wire = BASE64
            .decode(encoded)
            .map_err(|e| SecretsError::Cipher(format!("base64: {e}")))?;
        if wire.len() < NONCE_LEN {
            return Err(SecretsError::Cipher("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = wire.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| SecretsError::Cipher("bad nonce".to_string()))?;

        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| SecretsError::Cipher("invalid key".to_string()))?;
        let key = LessSafeKey::new(unbound);

        let mut buffer = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| SecretsError::Cipher("open failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn derived_keys_differ_by_scope_and_id() {
        let secrets = StaticSecrets::from_passphrase("test");
        let a = secrets.chat_key("c1").await.unwrap();
        let b = secrets.chat_key("c2").await.unwrap();
        let c = secrets.user_debug_key("c1").await.unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let encoded = CipherService::encrypt(&key, b"hello convoy").unwrap();
        let decoded = CipherService::decrypt(&key, &encoded).unwrap();
        assert_eq!(decoded, b"hello convoy");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let encoded = CipherService::encrypt(&[1u8; 32], b"secret").unwrap();
        assert!(CipherService::decrypt(&[2u8; 32], &encoded).is_err());
    }

    #[test]
    fn nonces_are_unique_per_message() {
        let key = [9u8; 32];
        let a = CipherService::encrypt(&key, b"same").unwrap();
        let b = CipherService::encrypt(&key, b"same").unwrap();
        assert_ne!(a, b);
    }
}
