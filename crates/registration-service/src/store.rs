//! Encrypted file persistence for the local store.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use rand::RngCore;
use registration_core::{Document, LocalStore, Persistence, StoreError};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// AES-256-GCM encrypted document file.
///
/// File format: `[12 bytes nonce][ciphertext with auth tag]`
pub struct EncryptedFile {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedFile {
    /// The encryption key is the SHA-256 digest of `secret`.
    pub fn new(path: PathBuf, secret: &SecretString) -> Self {
        Self {
            path,
            key: derive_key(secret),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    /// Load the document, or an empty one if the file doesn't exist.
    pub async fn load(&self) -> Result<Document, StoreError> {
        if !fs::try_exists(&self.path).await? {
            info!(path = ?self.path, "Store file not found, starting empty");
            return Ok(Document::default());
        }

        let data = fs::read(&self.path).await?;
        let plaintext = decrypt(&self.cipher(), &data)?;
        let document: Document = serde_json::from_slice(&plaintext)?;

        info!(
            path = ?self.path,
            identities = document.identities.len(),
            "Loaded encrypted store"
        );
        Ok(document)
    }
}

#[async_trait]
impl Persistence for EncryptedFile {
    async fn save(&self, document: &Document) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(document)?;
        let data = encrypt(&self.cipher(), &plaintext)?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically using temp file + rename
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &data).await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(bytes = data.len(), path = ?self.path, "Saved encrypted store");
        Ok(())
    }
}

/// Open the local store, encrypted on disk when a secret is configured.
pub async fn open_store(
    path: PathBuf,
    persist: bool,
    secret: Option<&SecretString>,
) -> Result<Arc<LocalStore>, StoreError> {
    let secret = match (persist, secret) {
        (true, Some(secret)) => secret,
        (true, None) => {
            warn!("No store secret configured, using in-memory storage (data will be lost on restart)");
            return Ok(Arc::new(LocalStore::memory()));
        }
        (false, _) => {
            info!("Persistence disabled, using in-memory storage");
            return Ok(Arc::new(LocalStore::memory()));
        }
    };

    let file = Arc::new(EncryptedFile::new(path, secret));
    let document = file.load().await?;
    Ok(Arc::new(LocalStore::new(document, Some(file))))
}

fn derive_key(secret: &SecretString) -> [u8; 32] {
    let digest = Sha256::digest(secret.expose_secret().as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

fn encrypt(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| StoreError::Encryption("AES-GCM encryption failed".into()))?;

    let mut data = nonce_bytes.to_vec();
    data.extend(ciphertext);
    Ok(data)
}

fn decrypt(cipher: &Aes256Gcm, data: &[u8]) -> Result<Vec<u8>, StoreError> {
    if data.len() < NONCE_SIZE {
        return Err(StoreError::Encryption("Store file too short".into()));
    }

    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    cipher.decrypt(nonce, &data[NONCE_SIZE..]).map_err(|_| {
        StoreError::Encryption("Failed to decrypt store. Was the secret changed?".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use registration_core::PreferencesStore;
    use tempfile::TempDir;

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.into())
    }

    #[test]
    fn test_encryption_round_trip() {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[0x42u8; 32]));
        let data = b"Hello, World!";

        let encrypted = encrypt(&cipher, data).unwrap();
        assert_ne!(&encrypted[NONCE_SIZE..], data);
        assert!(encrypted.len() > data.len());

        assert_eq!(decrypt(&cipher, &encrypted).unwrap(), data);
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[0x42u8; 32]));
        let mut encrypted = encrypt(&cipher, b"Sensitive information").unwrap();

        if let Some(byte) = encrypted.last_mut() {
            *byte ^= 0xFF;
        }

        assert!(matches!(
            decrypt(&cipher, &encrypted),
            Err(StoreError::Encryption(_))
        ));
        assert!(decrypt(&cipher, &[0u8; 4]).is_err());
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty_document() {
        let dir = TempDir::new().unwrap();
        let file = EncryptedFile::new(dir.path().join("store.enc"), &secret("s3cret"));

        let document = file.load().await.unwrap();
        assert!(document.identities.is_empty());
        assert!(document.preferences.local_number.is_none());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.enc");

        let store = open_store(path.clone(), true, Some(&secret("s3cret")))
            .await
            .unwrap();
        store
            .update_preferences(Box::new(|p| {
                p.local_number = Some("+15551234567".into());
                p.push_registered = true;
            }))
            .await
            .unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("+15551234567"));
        assert!(!path.with_extension("tmp").exists());

        let reopened = open_store(path, true, Some(&secret("s3cret")))
            .await
            .unwrap();
        let prefs = reopened.preferences().await.unwrap();
        assert_eq!(prefs.local_number.as_deref(), Some("+15551234567"));
        assert!(prefs.push_registered);
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.enc");

        EncryptedFile::new(path.clone(), &secret("right"))
            .save(&Document::default())
            .await
            .unwrap();

        let result = EncryptedFile::new(path, &secret("wrong")).load().await;
        assert!(matches!(result, Err(StoreError::Encryption(_))));
    }

    #[tokio::test]
    async fn test_without_secret_stays_in_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.enc");

        let store = open_store(path.clone(), true, None).await.unwrap();
        store
            .update_preferences(Box::new(|p| p.verifying = true))
            .await
            .unwrap();

        assert!(!path.exists());
    }
}
