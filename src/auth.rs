// =============================================================================
// Auth State (C9) — in-memory cookie blob with at-rest encryption
// =============================================================================
//
// The cookie blob is the one piece of state in this engine sensitive enough
// to encrypt at rest, the same "never persist secrets in the clear" posture
// as the teacher's `BinanceClient`, which never logs `api_key`/`secret` and
// gives itself a redacted `Debug` impl. Here the blob is AEAD-encrypted with
// a key derived from an operator-supplied secret before it ever reaches the
// `Store`.
// =============================================================================

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::event_bus::{EngineEvent, EventBus};
use crate::store::Store;

const NONCE_LEN: usize = 12;

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn encrypt(secret: &str, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let key_bytes = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("cookie encryption failed: {e}"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(secret: &str, blob: &[u8]) -> anyhow::Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        anyhow::bail!("cookie blob too short to contain a nonce");
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let key_bytes = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow::anyhow!("cookie decryption failed: {e}"))
}

/// Holds the current cookie blob in memory, persisting via C1 (§4.9).
pub struct AuthState {
    secret: String,
    store: Arc<dyn Store>,
    cookies: RwLock<Option<Vec<u8>>>,
}

impl AuthState {
    pub fn new(secret: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            secret: secret.into(),
            store,
            cookies: RwLock::new(None),
        }
    }

    /// Attempt recovery from the store at process start (§4.9). On decrypt
    /// failure, clears in-memory credentials and emits `authRequired`.
    pub async fn recover(&self, bus: &EventBus) {
        let Some(blob) = self.store.get_cookies().await else {
            info!("no persisted auth cookies found at startup");
            return;
        };

        let Ok(encoded) = std::str::from_utf8(&blob).map(|s| s.to_string()) else {
            self.clear_and_require_auth(bus).await;
            return;
        };
        let Ok(ciphertext) = BASE64.decode(encoded) else {
            self.clear_and_require_auth(bus).await;
            return;
        };

        match decrypt(&self.secret, &ciphertext) {
            Ok(plaintext) => {
                *self.cookies.write() = Some(plaintext);
                info!("recovered auth cookies from store");
            }
            Err(e) => {
                warn!(error = %e, "failed to decrypt persisted cookies");
                self.clear_and_require_auth(bus).await;
            }
        }
    }

    async fn clear_and_require_auth(&self, bus: &EventBus) {
        *self.cookies.write() = None;
        bus.broadcast_global(EngineEvent::AuthRequired).await;
    }

    /// Set a fresh cookie blob, encrypting it before persisting (§4.9).
    pub async fn set_cookies(&self, plaintext: Vec<u8>) -> anyhow::Result<()> {
        let ciphertext = encrypt(&self.secret, &plaintext)?;
        let encoded = BASE64.encode(ciphertext);
        *self.cookies.write() = Some(plaintext);
        self.store.save_cookies(encoded.as_bytes()).await;
        Ok(())
    }

    pub fn cookies(&self) -> Option<Vec<u8>> {
        self.cookies.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.cookies.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn encrypt_decrypt_round_trips() {
        let plaintext = b"session=abc123";
        let ciphertext = encrypt("a-test-secret", plaintext).unwrap();
        let decrypted = decrypt("a-test-secret", &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_secret_fails_to_decrypt() {
        let ciphertext = encrypt("right-secret", b"session=abc123").unwrap();
        assert!(decrypt("wrong-secret", &ciphertext).is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(decrypt("secret", b"too short").is_err());
    }

    #[tokio::test]
    async fn recover_with_no_stored_cookies_leaves_unauthenticated() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let auth = AuthState::new("secret", store);
        auth.recover(&bus).await;
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn set_then_recover_round_trips_through_store() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let auth = AuthState::new("secret", store.clone());
        auth.set_cookies(b"session=xyz".to_vec()).await.unwrap();

        let recovered = AuthState::new("secret", store);
        recovered.recover(&bus).await;
        assert_eq!(recovered.cookies(), Some(b"session=xyz".to_vec()));
    }

    #[tokio::test]
    async fn corrupt_stored_cookies_clear_and_emit_auth_required() {
        let store = Arc::new(MemoryStore::new());
        store.save_cookies(b"not valid base64 ciphertext!!").await;
        let bus = EventBus::new();
        let mut rx = bus.subscribe_global("test-sub".into());
        let auth = AuthState::new("secret", store);
        auth.recover(&bus).await;
        assert!(!auth.is_authenticated());
        let event = rx.try_recv();
        assert!(matches!(event, Ok(EngineEvent::AuthRequired)));
    }
}
