//! Vault for connector credentials, encrypted at rest with AES-GCM on top of
//! the blob storage. Each named secret map is one object under `vault/<name>`
//! holding `nonce (12 bytes) || ciphertext(JSON(secrets))`.

use crate::storage::{Storage, StorageError};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Storage subpath all vault objects live under.
pub const VAULT_PREFIX: &str = "vault";

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

type Aes192Gcm = AesGcm<Aes192, U12>;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Invalid encryption key length {0}: expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),

    #[error("Failed to decrypt secret {0}")]
    Decrypt(String),

    #[error("Failed to encrypt secret {0}")]
    Encrypt(String),

    #[error("Vault storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to (de)serialize secret {name}: {source}")]
    Serialization {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }
}

/// AES-GCM cipher sized by the configured key.
enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Cipher {
    fn new(key: &[u8]) -> Result<Self, VaultError> {
        let invalid = |_| VaultError::InvalidKeyLength(key.len());
        match key.len() {
            16 => Ok(Self::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(invalid)?,
            ))),
            24 => Ok(Self::Aes192(Box::new(
                Aes192Gcm::new_from_slice(key).map_err(invalid)?,
            ))),
            32 => Ok(Self::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(invalid)?,
            ))),
            other => Err(VaultError::InvalidKeyLength(other)),
        }
    }

    /// Returns `nonce || ciphertext` sealed under a fresh random nonce.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        let (nonce, ciphertext) = match self {
            Self::Aes128(c) => {
                let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
                (nonce, c.encrypt(&nonce, plaintext)?)
            }
            Self::Aes192(c) => {
                let nonce = Aes192Gcm::generate_nonce(&mut OsRng);
                (nonce, c.encrypt(&nonce, plaintext)?)
            }
            Self::Aes256(c) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                (nonce, c.encrypt(&nonce, plaintext)?)
            }
        };
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        if sealed.len() < NONCE_LEN {
            return Err(aes_gcm::Error);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = aes_gcm::Nonce::<U12>::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes192(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
    }
}

/// Encrypted secret store over a storage backend
pub struct Vault {
    storage: Arc<dyn Storage>,
    cipher: Cipher,
}

impl Vault {
    pub fn new(storage: Arc<dyn Storage>, key: &[u8]) -> Result<Self, VaultError> {
        Ok(Self {
            storage,
            cipher: Cipher::new(key)?,
        })
    }

    /// Storage key of a named secret.
    pub fn object_key(name: &str) -> String {
        format!("{}/{}", VAULT_PREFIX, name)
    }

    pub async fn put(&self, name: &str, secrets: &HashMap<String, String>) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(secrets).map_err(|source| VaultError::Serialization {
            name: name.to_string(),
            source,
        })?;
        let sealed = self
            .cipher
            .seal(&plaintext)
            .map_err(|_| VaultError::Encrypt(name.to_string()))?;
        self.storage
            .put(&Self::object_key(name), Bytes::from(sealed))
            .await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<HashMap<String, String>, VaultError> {
        let sealed = self.storage.get(&Self::object_key(name)).await?;
        let plaintext = self
            .cipher
            .open(&sealed)
            .map_err(|_| VaultError::Decrypt(name.to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|source| VaultError::Serialization {
            name: name.to_string(),
            source,
        })
    }

    pub async fn delete(&self, name: &str) -> Result<(), VaultError> {
        self.storage.delete(&Self::object_key(name)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use tempfile::TempDir;

    fn secrets() -> HashMap<String, String> {
        HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_round_trip_for_every_key_size() {
        for len in [16, 24, 32] {
            let temp_dir = TempDir::new().unwrap();
            let storage = Arc::new(FileStorage::new(temp_dir.path().to_path_buf()));
            let vault = Vault::new(storage, &vec![7u8; len]).unwrap();

            vault.put("k", &secrets()).await.unwrap();
            assert_eq!(vault.get("k").await.unwrap(), secrets());
        }
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_to_decrypt() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::new(temp_dir.path().to_path_buf()));
        let vault = Vault::new(storage, &[1u8; 32]).unwrap();
        vault.put("k", &secrets()).await.unwrap();

        let path = temp_dir.path().join("vault").join("k");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        let err = vault.get("k").await.unwrap_err();
        assert!(matches!(err, VaultError::Decrypt(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_nonce_is_fresh_per_put() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::new(temp_dir.path().to_path_buf()));
        let vault = Vault::new(storage, &[3u8; 16]).unwrap();
        let path = temp_dir.path().join("vault").join("k");

        vault.put("k", &secrets()).await.unwrap();
        let first = std::fs::read(&path).unwrap();
        vault.put("k", &secrets()).await.unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
    }

    #[tokio::test]
    async fn test_wrong_key_and_bad_lengths() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp_dir.path().to_path_buf()));
        let vault = Vault::new(storage.clone(), &[1u8; 32]).unwrap();
        vault.put("k", &secrets()).await.unwrap();

        let other = Vault::new(storage.clone(), &[2u8; 32]).unwrap();
        assert!(matches!(other.get("k").await, Err(VaultError::Decrypt(_))));

        assert!(matches!(
            Vault::new(storage, &[0u8; 20]),
            Err(VaultError::InvalidKeyLength(20))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::new(temp_dir.path().to_path_buf()));
        let vault = Vault::new(storage, &[9u8; 24]).unwrap();
        vault.put("k", &secrets()).await.unwrap();
        vault.delete("k").await.unwrap();
        assert!(vault.get("k").await.unwrap_err().is_not_found());
    }
}
