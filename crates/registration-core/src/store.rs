//! Local persistence for preferences, key material and verified identities.

use crate::error::StoreError;
use crate::keys::{IdentityKey, IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Registration-related preferences.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub local_number: Option<String>,
    pub verifying: bool,
    pub push_registered: bool,
    pub push_disabled: bool,
    pub websocket_registered: bool,
    pub signed_pre_key_registered: bool,
    pub prompted_push_registration: bool,
    pub registration_id: Option<u32>,
    pub push_token: Option<String>,
    pub push_server_password: Option<String>,
    pub signaling_key: Option<String>,
}

impl fmt::Debug for Preferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preferences")
            .field("local_number", &self.local_number)
            .field("verifying", &self.verifying)
            .field("push_registered", &self.push_registered)
            .field("push_disabled", &self.push_disabled)
            .field("websocket_registered", &self.websocket_registered)
            .field("signed_pre_key_registered", &self.signed_pre_key_registered)
            .field("registration_id", &self.registration_id)
            .field("has_push_token", &self.push_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Key material at rest.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyState {
    pub identity_key_pair: Option<[u8; 32]>,
    pub next_pre_key_id: Option<u32>,
    pub next_signed_pre_key_id: Option<u32>,
    pub active_signed_pre_key_id: Option<u32>,
    pub pre_keys: BTreeMap<u32, [u8; 32]>,
    pub signed_pre_keys: BTreeMap<u32, StoredSignedPreKey>,
}

impl fmt::Debug for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyState")
            .field("has_identity", &self.identity_key_pair.is_some())
            .field("next_pre_key_id", &self.next_pre_key_id)
            .field("next_signed_pre_key_id", &self.next_signed_pre_key_id)
            .field("active_signed_pre_key_id", &self.active_signed_pre_key_id)
            .field("pre_keys", &self.pre_keys.len())
            .field("signed_pre_keys", &self.signed_pre_keys.len())
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoredSignedPreKey {
    pub private_key: [u8; 32],
    pub signature: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifiedStatus {
    Default,
    Verified,
    Unverified,
}

/// An identity recorded as verified for an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    /// Hex encoded identity public key
    pub identity_key: String,
    pub status: VerifiedStatus,
    pub first_use: bool,
    pub timestamp: DateTime<Utc>,
    pub non_blocking_approval: bool,
}

/// Everything the local store holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub preferences: Preferences,
    pub keys: KeyState,
    pub identities: BTreeMap<String, VerifiedIdentity>,
    /// Bumped each time all sessions are archived
    pub session_generation: u64,
    pub sessions_archived_at: Option<DateTime<Utc>>,
}

/// In-place edit of the stored preferences.
pub type PreferencesUpdate = Box<dyn for<'a> FnOnce(&'a mut Preferences) + Send>;

/// Signed pre-keys kept besides the active one, newest first.
pub const SIGNED_PRE_KEY_RETENTION: usize = 2;

/// Device preferences.
///
/// Implementations apply updates one at a time, each against the result of
/// the previous one.
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    async fn preferences(&self) -> Result<Preferences, StoreError>;

    async fn update_preferences(&self, apply: PreferencesUpdate) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IdentitySessionStore: Send + Sync {
    /// Archive every session so peers rebuild them with the new keys.
    async fn archive_all_sessions(&self) -> Result<(), StoreError>;

    async fn save_verified_identity(
        &self,
        address: &str,
        identity_key: &IdentityKey,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, StoreError>;

    async fn save_identity_key_pair(&self, identity: &IdentityKeyPair) -> Result<(), StoreError>;

    async fn next_pre_key_id(&self) -> Result<Option<u32>, StoreError>;

    /// Persist one-time pre-keys. `replace` drops every previously stored one.
    async fn store_pre_keys(
        &self,
        records: &[PreKeyRecord],
        next_id: u32,
        replace: bool,
    ) -> Result<(), StoreError>;

    async fn next_signed_pre_key_id(&self) -> Result<Option<u32>, StoreError>;

    /// Persist a signed pre-key, pruning all but the active one and the
    /// [`SIGNED_PRE_KEY_RETENTION`] newest.
    async fn store_signed_pre_key(
        &self,
        record: &SignedPreKeyRecord,
        next_id: u32,
    ) -> Result<(), StoreError>;

    async fn active_signed_pre_key_id(&self) -> Result<Option<u32>, StoreError>;

    async fn set_active_signed_pre_key_id(&self, id: u32) -> Result<(), StoreError>;
}

/// Where a [`LocalStore`] writes its document after each change.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save(&self, document: &Document) -> Result<(), StoreError>;
}

/// Document-backed store implementing every local storage trait.
///
/// Changes are applied to a copy, persisted, and only then committed, so a
/// failed write leaves the in-memory document untouched.
pub struct LocalStore {
    document: RwLock<Document>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl LocalStore {
    pub fn new(document: Document, persistence: Option<Arc<dyn Persistence>>) -> Self {
        Self {
            document: RwLock::new(document),
            persistence,
        }
    }

    /// In-memory only store.
    pub fn memory() -> Self {
        Self::new(Document::default(), None)
    }

    pub async fn snapshot(&self) -> Document {
        self.document.read().await.clone()
    }

    pub async fn set_next_pre_key_id(&self, id: u32) -> Result<(), StoreError> {
        self.mutate(|doc| doc.keys.next_pre_key_id = Some(id)).await
    }

    async fn mutate<R, F>(&self, apply: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Document) -> R + Send,
        R: Send,
    {
        let mut document = self.document.write().await;
        let mut next = document.clone();
        let result = apply(&mut next);

        if let Some(persistence) = &self.persistence {
            persistence.save(&next).await?;
        }

        *document = next;
        Ok(result)
    }
}

#[async_trait]
impl PreferencesStore for LocalStore {
    async fn preferences(&self) -> Result<Preferences, StoreError> {
        Ok(self.document.read().await.preferences.clone())
    }

    async fn update_preferences(&self, apply: PreferencesUpdate) -> Result<(), StoreError> {
        self.mutate(move |doc| apply(&mut doc.preferences)).await
    }
}

#[async_trait]
impl IdentitySessionStore for LocalStore {
    async fn archive_all_sessions(&self) -> Result<(), StoreError> {
        let generation = self
            .mutate(|doc| {
                doc.session_generation += 1;
                doc.sessions_archived_at = Some(Utc::now());
                doc.session_generation
            })
            .await?;

        debug!(generation, "Archived all sessions");
        Ok(())
    }

    async fn save_verified_identity(
        &self,
        address: &str,
        identity_key: &IdentityKey,
    ) -> Result<(), StoreError> {
        let record = VerifiedIdentity {
            identity_key: identity_key.fingerprint(),
            status: VerifiedStatus::Verified,
            first_use: true,
            timestamp: Utc::now(),
            non_blocking_approval: true,
        };
        let address = address.to_string();

        self.mutate(move |doc| {
            doc.identities.insert(address, record);
        })
        .await
    }
}

#[async_trait]
impl KeyStore for LocalStore {
    async fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        Ok(self
            .document
            .read()
            .await
            .keys
            .identity_key_pair
            .as_ref()
            .map(IdentityKeyPair::from_bytes))
    }

    async fn save_identity_key_pair(&self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        let bytes = identity.to_bytes();
        self.mutate(move |doc| doc.keys.identity_key_pair = Some(bytes))
            .await
    }

    async fn next_pre_key_id(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.document.read().await.keys.next_pre_key_id)
    }

    async fn store_pre_keys(
        &self,
        records: &[PreKeyRecord],
        next_id: u32,
        replace: bool,
    ) -> Result<(), StoreError> {
        let entries: Vec<(u32, [u8; 32])> = records
            .iter()
            .map(|r| (r.id, r.key_pair.secret_bytes()))
            .collect();

        self.mutate(move |doc| {
            if replace {
                doc.keys.pre_keys.clear();
            }
            doc.keys.pre_keys.extend(entries);
            doc.keys.next_pre_key_id = Some(next_id);
        })
        .await
    }

    async fn next_signed_pre_key_id(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.document.read().await.keys.next_signed_pre_key_id)
    }

    async fn store_signed_pre_key(
        &self,
        record: &SignedPreKeyRecord,
        next_id: u32,
    ) -> Result<(), StoreError> {
        let id = record.id;
        let stored = StoredSignedPreKey {
            private_key: record.key_pair.secret_bytes(),
            signature: record.signature.to_vec(),
            timestamp: record.timestamp,
        };

        let pruned = self
            .mutate(move |doc| {
                let keys = &mut doc.keys;
                keys.signed_pre_keys.insert(id, stored);
                keys.next_signed_pre_key_id = Some(next_id);
                prune_signed_pre_keys(keys)
            })
            .await?;

        if pruned > 0 {
            debug!(pruned, "Pruned superseded signed pre-keys");
        }
        Ok(())
    }

    async fn active_signed_pre_key_id(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.document.read().await.keys.active_signed_pre_key_id)
    }

    async fn set_active_signed_pre_key_id(&self, id: u32) -> Result<(), StoreError> {
        self.mutate(move |doc| doc.keys.active_signed_pre_key_id = Some(id))
            .await
    }
}

/// Drop signed pre-keys that are neither active nor among the newest few.
fn prune_signed_pre_keys(keys: &mut KeyState) -> usize {
    let active = keys.active_signed_pre_key_id;
    let mut inactive: Vec<(DateTime<Utc>, u32)> = keys
        .signed_pre_keys
        .iter()
        .filter(|(id, _)| Some(**id) != active)
        .map(|(id, stored)| (stored.timestamp, *id))
        .collect();
    if inactive.len() <= SIGNED_PRE_KEY_RETENTION {
        return 0;
    }

    inactive.sort_unstable_by(|a, b| b.cmp(a));
    let stale = &inactive[SIGNED_PRE_KEY_RETENTION..];
    for (_, id) in stale {
        keys.signed_pre_keys.remove(id);
    }
    stale.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every saved document; optionally refuses writes.
    #[derive(Default)]
    struct RecordingPersistence {
        saved: Mutex<Vec<Document>>,
        fail: bool,
    }

    #[async_trait]
    impl Persistence for RecordingPersistence {
        async fn save(&self, document: &Document) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Io("read-only filesystem".into()));
            }
            self.saved.lock().push(document.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_update_preferences() {
        let store = LocalStore::memory();

        store
            .update_preferences(Box::new(|p| {
                p.verifying = true;
                p.local_number = Some("+15551234567".into());
            }))
            .await
            .unwrap();

        let prefs = store.preferences().await.unwrap();
        assert!(prefs.verifying);
        assert_eq!(prefs.local_number.as_deref(), Some("+15551234567"));
    }

    #[tokio::test]
    async fn test_changes_are_persisted() {
        let persistence = Arc::new(RecordingPersistence::default());
        let store = LocalStore::new(Document::default(), Some(persistence.clone()));

        store
            .update_preferences(Box::new(|p| p.push_registered = true))
            .await
            .unwrap();
        store.archive_all_sessions().await.unwrap();

        let saved = persistence.saved.lock();
        assert_eq!(saved.len(), 2);
        assert!(saved[0].preferences.push_registered);
        assert_eq!(saved[1].session_generation, 1);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_document_untouched() {
        let persistence = Arc::new(RecordingPersistence {
            fail: true,
            ..Default::default()
        });
        let store = LocalStore::new(Document::default(), Some(persistence));

        let result = store
            .update_preferences(Box::new(|p| p.push_registered = true))
            .await;

        assert!(result.is_err());
        assert!(!store.preferences().await.unwrap().push_registered);
    }

    #[tokio::test]
    async fn test_save_verified_identity() {
        let store = LocalStore::memory();
        let identity = IdentityKeyPair::generate().public_key();

        store
            .save_verified_identity("+15551234567", &identity)
            .await
            .unwrap();

        let doc = store.snapshot().await;
        let record = doc.identities.get("+15551234567").unwrap();
        assert_eq!(record.status, VerifiedStatus::Verified);
        assert_eq!(record.identity_key, identity.fingerprint());
        assert!(record.non_blocking_approval);
    }

    #[tokio::test]
    async fn test_identity_key_pair_round_trip() {
        let store = LocalStore::memory();
        assert!(store.identity_key_pair().await.unwrap().is_none());

        let identity = IdentityKeyPair::generate();
        store.save_identity_key_pair(&identity).await.unwrap();

        let loaded = store.identity_key_pair().await.unwrap().unwrap();
        assert_eq!(loaded.public_key(), identity.public_key());
    }

    fn signed_pre_key(id: u32, age_secs: i64) -> SignedPreKeyRecord {
        SignedPreKeyRecord {
            id,
            key_pair: crate::keys::PreKeyPair::generate(),
            signature: [0u8; 64],
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_signed_pre_keys_are_pruned() {
        let store = LocalStore::memory();
        store.store_signed_pre_key(&signed_pre_key(1, 50), 2).await.unwrap();
        store.set_active_signed_pre_key_id(1).await.unwrap();

        for (id, age) in [(2, 40), (3, 30), (4, 20), (5, 10)] {
            store.store_signed_pre_key(&signed_pre_key(id, age), id + 1).await.unwrap();
        }

        let keys = store.snapshot().await.keys;
        let ids: Vec<u32> = keys.signed_pre_keys.keys().copied().collect();
        assert_eq!(ids, vec![1, 4, 5]);
        assert_eq!(keys.active_signed_pre_key_id, Some(1));
        assert_eq!(keys.next_signed_pre_key_id, Some(6));
    }

    #[tokio::test]
    async fn test_replacing_pre_keys_drops_previous_batch() {
        let store = LocalStore::memory();
        let batch = |ids: &[u32]| -> Vec<PreKeyRecord> {
            ids.iter()
                .map(|id| PreKeyRecord {
                    id: *id,
                    key_pair: crate::keys::PreKeyPair::generate(),
                })
                .collect()
        };

        store.store_pre_keys(&batch(&[1, 2]), 3, false).await.unwrap();
        store.store_pre_keys(&batch(&[3, 4]), 5, false).await.unwrap();
        assert_eq!(store.snapshot().await.keys.pre_keys.len(), 4);

        store.store_pre_keys(&batch(&[5, 6]), 7, true).await.unwrap();
        let keys = store.snapshot().await.keys;
        assert_eq!(keys.pre_keys.keys().copied().collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(keys.next_pre_key_id, Some(7));
    }

    #[test]
    fn test_document_serialization() {
        let mut doc = Document::default();
        doc.preferences.local_number = Some("+15551234567".into());
        doc.keys.pre_keys.insert(7, [1u8; 32]);

        let json = serde_json::to_vec(&doc).unwrap();
        let restored: Document = serde_json::from_slice(&json).unwrap();

        assert_eq!(restored.preferences, doc.preferences);
        assert_eq!(restored.keys.pre_keys.get(&7), Some(&[1u8; 32]));
    }

    #[test]
    fn test_preferences_debug_redacts_secrets() {
        let prefs = Preferences {
            push_server_password: Some("hunter2".into()),
            signaling_key: Some("signal-me".into()),
            ..Default::default()
        };
        let debug = format!("{:?}", prefs);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("signal-me"));
    }
}
