use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::Mac;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::core::error::CredentialError;
use crate::core::memory::types::from_millis;

type HmacSha256 = hmac::Hmac<Sha256>;

const KEY_CONTEXT: &[u8] = b"conductor-vault-v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

impl From<VaultError> for CredentialError {
    fn from(err: VaultError) -> Self {
        CredentialError::Store(err.to_string())
    }
}

/// A token set as held in memory. Plaintext is wiped on drop and never shown
/// by `Debug`.
#[derive(Clone)]
pub struct StoredCredential {
    pub access_token: Zeroizing<String>,
    pub refresh_token: Option<Zeroizing<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: String,
    pub updated_at: DateTime<Utc>,
}

impl StoredCredential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Zeroizing::new(access_token.into()),
            refresh_token: None,
            expires_at: None,
            scopes: String::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(Zeroizing::new(token.into()));
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scopes(mut self, scopes: impl Into<String>) -> Self {
        self.scopes = scopes.into();
        self
    }

    /// True when the access token is expired or expires within `skew`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - skew <= now,
            None => false,
        }
    }
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Opaque per-user credential storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, user_id: &str, service: &str)
    -> Result<Option<StoredCredential>, VaultError>;
    async fn put(
        &self,
        user_id: &str,
        service: &str,
        credential: &StoredCredential,
    ) -> Result<(), VaultError>;
    /// Returns whether a credential was removed.
    async fn delete(&self, user_id: &str, service: &str) -> Result<bool, VaultError>;
}

/// Derive a 256-bit key with HMAC-SHA256. A configured master secret wins;
/// otherwise the key is tied to this machine and OS user.
fn derive_key(master_key: Option<&str>) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    let input = match master_key {
        Some(secret) => Zeroizing::new(secret.to_string()),
        None => {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-host".to_string());
            Zeroizing::new(format!("{}{}", hostname, whoami::username()))
        }
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(KEY_CONTEXT)
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// AES-256-GCM over `base64(nonce || ciphertext)`.
pub struct VaultCipher {
    cipher: Aes256Gcm,
}

impl VaultCipher {
    pub fn new(master_key: Option<&str>) -> Result<Self, VaultError> {
        let key = derive_key(master_key)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Zeroizing<String>, VaultError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| VaultError::Decrypt(format!("base64: {}", e)))?;

        if combined.len() <= NONCE_LEN {
            return Err(VaultError::Decrypt("value too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| VaultError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| VaultError::Decrypt(format!("utf-8: {}", e)))
    }
}

/// Secret store over the `credentials` table. Every statement is scoped by
/// `user_id`.
pub struct SqliteSecretStore {
    db: Arc<Mutex<Connection>>,
    cipher: VaultCipher,
}

impl SqliteSecretStore {
    pub fn new(db: Arc<Mutex<Connection>>, master_key: Option<&str>) -> Result<Self, VaultError> {
        Ok(Self {
            db,
            cipher: VaultCipher::new(master_key)?,
        })
    }
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn get(
        &self,
        user_id: &str,
        service: &str,
    ) -> Result<Option<StoredCredential>, VaultError> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                "SELECT access_token_enc, refresh_token_enc, expires_at, scopes, updated_at
                 FROM credentials WHERE user_id = ?1 AND service_name = ?2",
                params![user_id, service],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((access_enc, refresh_enc, expires_at, scopes, updated_at)) = row else {
            return Ok(None);
        };

        let refresh_token = match refresh_enc {
            Some(enc) => Some(self.cipher.decrypt(&enc)?),
            None => None,
        };
        Ok(Some(StoredCredential {
            access_token: self.cipher.decrypt(&access_enc)?,
            refresh_token,
            expires_at: expires_at.map(from_millis),
            scopes,
            updated_at: from_millis(updated_at),
        }))
    }

    async fn put(
        &self,
        user_id: &str,
        service: &str,
        credential: &StoredCredential,
    ) -> Result<(), VaultError> {
        let access_enc = self.cipher.encrypt(&credential.access_token)?;
        let refresh_enc = match &credential.refresh_token {
            Some(token) => Some(self.cipher.encrypt(token)?),
            None => None,
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO credentials
                (user_id, service_name, access_token_enc, refresh_token_enc, expires_at, scopes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, service_name) DO UPDATE SET
                access_token_enc = excluded.access_token_enc,
                refresh_token_enc = excluded.refresh_token_enc,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                updated_at = excluded.updated_at",
            params![
                user_id,
                service,
                access_enc,
                refresh_enc,
                credential.expires_at.map(|t| t.timestamp_millis()),
                credential.scopes,
                credential.updated_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    async fn delete(&self, user_id: &str, service: &str) -> Result<bool, VaultError> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND service_name = ?2",
            params![user_id, service],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::test_memory_system;

    fn test_cipher() -> VaultCipher {
        VaultCipher::new(Some("test-master-key")).unwrap()
    }

    fn test_store() -> SqliteSecretStore {
        let mem = test_memory_system();
        SqliteSecretStore::new(mem.get_db(), Some("test-master-key")).unwrap()
    }

    #[test]
    fn encrypt_produces_different_ciphertext_each_time() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same-input").unwrap();
        let b = cipher.encrypt("same-input").unwrap();
        assert_ne!(a, b, "random nonce should produce different ciphertext");
        assert_eq!(cipher.decrypt(&a).unwrap().as_str(), "same-input");
        assert_eq!(cipher.decrypt(&b).unwrap().as_str(), "same-input");
    }

    #[test]
    fn decrypt_rejects_short_input() {
        let short = base64::engine::general_purpose::STANDARD.encode(b"short");
        assert!(test_cipher().decrypt(&short).is_err());
    }

    #[test]
    fn different_master_keys_cannot_read_each_other() {
        let encrypted = test_cipher().encrypt("token").unwrap();
        let other = VaultCipher::new(Some("another-key")).unwrap();
        assert!(matches!(other.decrypt(&encrypted), Err(VaultError::Decrypt(_))));
    }

    #[test]
    fn machine_key_fallback_is_stable() {
        let a = VaultCipher::new(None).unwrap();
        let b = VaultCipher::new(None).unwrap();
        let encrypted = a.encrypt("token").unwrap();
        assert_eq!(b.decrypt(&encrypted).unwrap().as_str(), "token");
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let cred = StoredCredential::new("access-secret").with_refresh_token("refresh-secret");
        let shown = format!("{:?}", cred);
        assert!(!shown.contains("access-secret"));
        assert!(!shown.contains("refresh-secret"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn needs_refresh_respects_skew() {
        let now = Utc::now();
        let skew = chrono::Duration::seconds(60);
        let fresh = StoredCredential::new("a").with_expiry(now + chrono::Duration::minutes(10));
        let soon = StoredCredential::new("a").with_expiry(now + chrono::Duration::seconds(30));
        let forever = StoredCredential::new("a");
        assert!(!fresh.needs_refresh(now, skew));
        assert!(soon.needs_refresh(now, skew));
        assert!(!forever.needs_refresh(now, skew));
    }

    #[tokio::test]
    async fn put_get_delete_scoped_per_user() {
        let store = test_store();
        let cred = StoredCredential::new("tok-1")
            .with_refresh_token("ref-1")
            .with_scopes("mail.read");
        store.put("alice", "gmail", &cred).await.unwrap();

        let loaded = store.get("alice", "gmail").await.unwrap().unwrap();
        assert_eq!(loaded.access_token.as_str(), "tok-1");
        assert_eq!(loaded.refresh_token.as_ref().unwrap().as_str(), "ref-1");
        assert_eq!(loaded.scopes, "mail.read");
        assert!(store.get("bob", "gmail").await.unwrap().is_none());

        assert!(!store.delete("bob", "gmail").await.unwrap());
        assert!(store.delete("alice", "gmail").await.unwrap());
        assert!(store.get("alice", "gmail").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tokens_are_not_stored_in_plaintext() {
        let mem = test_memory_system();
        let store = SqliteSecretStore::new(mem.get_db(), Some("k")).unwrap();
        store
            .put("alice", "github", &StoredCredential::new("plain-token-value"))
            .await
            .unwrap();

        let db = mem.get_db();
        let db = db.lock().await;
        let raw: String = db
            .query_row(
                "SELECT access_token_enc FROM credentials WHERE user_id = 'alice'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("plain-token-value"));
    }
}
