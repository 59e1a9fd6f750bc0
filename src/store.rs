//! Persistence: the cross-task key-value store and the API-key cipher.
//!
//! The store is a flat JSON file; the cipher wraps AES-256-GCM with a
//! machine-local key so the configured API key is never written in the clear.

use std::collections::BTreeMap;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;

use crate::errors::EngineError;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const ENCRYPTED_PREFIX: &str = "enc:v1:";
const KEY_ENV_VAR: &str = "RLM_PRIVATE_KEY";

/// Flat JSON-file key-value store, loaded eagerly and rewritten on change.
pub struct KvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl KvStore {
    pub fn open(path: PathBuf) -> Result<Self, EngineError> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|err| EngineError::storage(format!("corrupt store file: {err}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(EngineError::storage(err.to_string())),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn put(&self, key: &str, value: Value) -> Result<(), EngineError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| EngineError::storage(err.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|err| EngineError::storage(err.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|err| EngineError::storage(err.to_string()))
    }
}

/// AES-256-GCM envelope for secrets at rest: `enc:v1:<base64(nonce ++ ct)>`.
pub struct ApiKeyCipher {
    key: [u8; KEY_LENGTH],
}

impl ApiKeyCipher {
    pub fn from_key(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Load the machine key from `RLM_PRIVATE_KEY` (base64) or the key file,
    /// generating and persisting a fresh one on first use.
    pub fn load_or_create() -> Result<Self, EngineError> {
        if let Ok(encoded) = std::env::var(KEY_ENV_VAR) {
            let decoded = BASE64
                .decode(encoded.trim())
                .map_err(|err| EngineError::storage(format!("bad {KEY_ENV_VAR}: {err}")))?;
            let key: [u8; KEY_LENGTH] = decoded
                .try_into()
                .map_err(|_| EngineError::storage(format!("{KEY_ENV_VAR} must be 32 bytes")))?;
            return Ok(Self::from_key(key));
        }

        let path = Self::key_file_path();
        match std::fs::read(&path) {
            Ok(raw) => {
                let key: [u8; KEY_LENGTH] = raw
                    .try_into()
                    .map_err(|_| EngineError::storage("key file is not 32 bytes"))?;
                Ok(Self::from_key(key))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; KEY_LENGTH];
                rand::thread_rng().fill_bytes(&mut key);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|err| EngineError::storage(err.to_string()))?;
                }
                std::fs::write(&path, key).map_err(|err| EngineError::storage(err.to_string()))?;
                Ok(Self::from_key(key))
            }
            Err(err) => Err(EngineError::storage(err.to_string())),
        }
    }

    fn key_file_path() -> PathBuf {
        let base = std::env::var("RLM_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".config").join("rlm")
            });
        base.join("secret.key")
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, EngineError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| EngineError::storage("encryption failed"))?;
        let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(blob)))
    }

    pub fn decrypt(&self, value: &str) -> Result<String, EngineError> {
        let encoded = value
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or_else(|| EngineError::storage("value is not an encrypted blob"))?;
        let blob = BASE64
            .decode(encoded)
            .map_err(|err| EngineError::storage(format!("bad blob encoding: {err}")))?;
        if blob.len() <= NONCE_LENGTH {
            return Err(EngineError::storage("encrypted blob too short"));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LENGTH);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EngineError::storage("decryption failed (wrong key?)"))?;
        String::from_utf8(plaintext).map_err(|err| EngineError::storage(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kv_store_roundtrip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = KvStore::open(path.clone()).unwrap();
        store.put("notes", json!({"a": 1})).unwrap();
        assert_eq!(store.get("notes").unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.get("missing").unwrap(), None);

        let reloaded = KvStore::open(path).unwrap();
        assert_eq!(reloaded.get("notes").unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn cipher_roundtrip() {
        let cipher = ApiKeyCipher::from_key([7u8; KEY_LENGTH]);
        let blob = cipher.encrypt("sk-secret-key").unwrap();
        assert!(ApiKeyCipher::is_encrypted(&blob));
        assert!(!blob.contains("sk-secret-key"));
        assert_eq!(cipher.decrypt(&blob).unwrap(), "sk-secret-key");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = ApiKeyCipher::from_key([7u8; KEY_LENGTH]);
        let blob = cipher.encrypt("secret").unwrap();
        let other = ApiKeyCipher::from_key([8u8; KEY_LENGTH]);
        assert!(other.decrypt(&blob).is_err());
    }
}
