//! Identity and pre-key provisioning.
//!
//! The identity key is an Ed25519 key pair that lives for as long as the
//! device does. One-time pre-keys and signed pre-keys are X25519 key pairs;
//! a signed pre-key carries an identity signature over its public key.

use crate::account::AccountClient;
use crate::error::{KeyError, RegistrationResult};
use crate::store::KeyStore;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use x25519_dalek::{PublicKey, StaticSecret};

/// Largest key id; ids are 24-bit.
pub const MEDIUM_MAX_VALUE: u32 = 0xFF_FFFF;

/// Number of one-time pre-keys uploaded per registration.
pub const PRE_KEY_BATCH_SIZE: usize = 100;

/// Long-term identity key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Private key bytes, for persistence only.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> IdentityKey {
        IdentityKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Public half of the identity key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey([u8; 32]);

impl IdentityKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding, used in logs and safety-number displays.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.0)
    }

    /// Check an identity signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(signature)).is_ok()
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.fingerprint())
    }
}

/// X25519 key pair used for pre-keys.
#[derive(Clone)]
pub struct PreKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl PreKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        self.public.as_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// A one-time pre-key.
#[derive(Clone)]
pub struct PreKeyRecord {
    pub id: u32,
    pub key_pair: PreKeyPair,
}

impl fmt::Debug for PreKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKeyRecord").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A signed pre-key.
#[derive(Clone)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub key_pair: PreKeyPair,
    pub signature: [u8; 64],
    pub timestamp: DateTime<Utc>,
}

impl fmt::Debug for SignedPreKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPreKeyRecord")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Everything uploaded to the account service at registration.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub identity_key_pair: IdentityKeyPair,
    pub pre_keys: Vec<PreKeyRecord>,
    pub signed_pre_key: SignedPreKeyRecord,
}

/// Generates and persists identity and pre-key material.
pub struct KeyProvisioner {
    store: Arc<dyn KeyStore>,
    batch_size: usize,
    identity_lock: Mutex<()>,
    /// Held from reading the next id until the keys using it are stored
    allocation_lock: Mutex<()>,
}

impl KeyProvisioner {
    pub fn new(store: Arc<dyn KeyStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size,
            identity_lock: Mutex::new(()),
            allocation_lock: Mutex::new(()),
        }
    }

    /// Return the persisted identity key pair, generating it on first use.
    pub async fn get_or_create_identity_key_pair(&self) -> Result<IdentityKeyPair, KeyError> {
        let _guard = self.identity_lock.lock().await;

        if let Some(existing) = self.store.identity_key_pair().await? {
            return Ok(existing);
        }

        let identity = IdentityKeyPair::generate();
        self.store.save_identity_key_pair(&identity).await?;
        info!(
            fingerprint = %identity.public_key().fingerprint(),
            "Generated new identity key pair"
        );
        Ok(identity)
    }

    /// Generate `count` one-time pre-keys with increasing, wrapping ids.
    #[instrument(skip(self))]
    pub async fn generate_pre_keys(&self, count: usize) -> Result<Vec<PreKeyRecord>, KeyError> {
        self.allocate_pre_keys(count, false).await
    }

    async fn allocate_pre_keys(
        &self,
        count: usize,
        replace: bool,
    ) -> Result<Vec<PreKeyRecord>, KeyError> {
        let _guard = self.allocation_lock.lock().await;
        let offset = match self.store.next_pre_key_id().await? {
            Some(id) => id,
            None => OsRng.gen_range(0..MEDIUM_MAX_VALUE),
        };

        let records: Vec<PreKeyRecord> = (0..count as u32)
            .map(|i| PreKeyRecord {
                id: pre_key_id(offset, i),
                key_pair: PreKeyPair::generate(),
            })
            .collect();

        let next_id = pre_key_id(offset, count as u32);
        self.store.store_pre_keys(&records, next_id, replace).await?;

        debug!(count, next_id, replace, "Generated one-time pre-keys");
        Ok(records)
    }

    /// Generate a signed pre-key, optionally advertising it as the active one.
    #[instrument(skip(self, identity))]
    pub async fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
        mark_active: bool,
    ) -> Result<SignedPreKeyRecord, KeyError> {
        let _guard = self.allocation_lock.lock().await;
        let id = match self.store.next_signed_pre_key_id().await? {
            Some(id) => id,
            None => OsRng.gen_range(0..MEDIUM_MAX_VALUE),
        };

        let key_pair = PreKeyPair::generate();
        let signature = identity.sign(key_pair.public_key());
        let record = SignedPreKeyRecord {
            id,
            key_pair,
            signature,
            timestamp: Utc::now(),
        };

        self.store
            .store_signed_pre_key(&record, (id + 1) % MEDIUM_MAX_VALUE)
            .await?;
        if mark_active {
            self.store.set_active_signed_pre_key_id(id).await?;
        }

        debug!(id, mark_active, "Generated signed pre-key");
        Ok(record)
    }

    /// Identity key pair plus a fresh batch of pre-keys and an active signed pre-key.
    ///
    /// The batch replaces every stored one-time pre-key, as uploading it
    /// replaces the set held by the account service.
    pub async fn generate_bundle(&self) -> Result<PreKeyBundle, KeyError> {
        let identity_key_pair = self.get_or_create_identity_key_pair().await?;
        let pre_keys = self.allocate_pre_keys(self.batch_size, true).await?;
        let signed_pre_key = self.generate_signed_pre_key(&identity_key_pair, true).await?;

        Ok(PreKeyBundle {
            identity_key_pair,
            pre_keys,
            signed_pre_key,
        })
    }

    /// Replace the advertised signed pre-key.
    ///
    /// The new key only becomes active once the account service accepted it.
    pub async fn rotate_signed_pre_key(
        &self,
        account: &dyn AccountClient,
    ) -> RegistrationResult<SignedPreKeyRecord> {
        let identity = self.get_or_create_identity_key_pair().await?;
        let record = self.generate_signed_pre_key(&identity, false).await?;

        account.set_signed_pre_key(&record).await?;
        self.store.set_active_signed_pre_key_id(record.id).await?;

        info!(id = record.id, "Rotated signed pre-key");
        Ok(record)
    }
}

fn pre_key_id(offset: u32, index: u32) -> u32 {
    ((offset + index) % (MEDIUM_MAX_VALUE - 1)) + 1
}
