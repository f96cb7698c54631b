//! Contact directory synchronisation.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use parking_lot::RwLock;
use registration_core::{AccountClient, AccountError, DirectoryRefresher};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Bytes of the number digest kept in a contact token.
const TOKEN_LEN: usize = 10;

/// Discovers which contacts are registered with the account service.
#[derive(Clone, Default)]
pub struct DirectorySync {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    contacts: RwLock<BTreeSet<String>>,
    registered: RwLock<BTreeSet<String>>,
}

impl DirectorySync {
    pub fn new(contacts: impl IntoIterator<Item = String>) -> Self {
        let sync = Self::default();
        sync.set_contacts(contacts);
        sync
    }

    pub fn set_contacts(&self, contacts: impl IntoIterator<Item = String>) {
        *self.inner.contacts.write() = contacts.into_iter().collect();
    }

    /// Contacts found registered by the last refresh.
    pub fn registered(&self) -> Vec<String> {
        self.inner.registered.read().iter().cloned().collect()
    }

    /// Query the account service and record the registered subset.
    pub async fn refresh(&self, account: &dyn AccountClient) -> Result<usize, AccountError> {
        let by_token: HashMap<String, String> = self
            .inner
            .contacts
            .read()
            .iter()
            .map(|number| (contact_token(number), number.clone()))
            .collect();
        let tokens: Vec<String> = by_token.keys().cloned().collect();

        let found = account.refresh_directory(&tokens).await?;
        let registered: BTreeSet<String> = found
            .iter()
            .filter_map(|token| by_token.get(token).cloned())
            .collect();

        let count = registered.len();
        *self.inner.registered.write() = registered;

        info!(contacts = tokens.len(), registered = count, "Directory refreshed");
        Ok(count)
    }
}

impl DirectoryRefresher for DirectorySync {
    fn refresh_directory(&self, account: Arc<dyn AccountClient>) {
        let sync = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.refresh(account.as_ref()).await {
                warn!(error = %e, "Directory refresh failed");
            }
        });
    }
}

/// Truncated SHA-256 of an E.164 number, base64 without padding.
pub fn contact_token(number: &str) -> String {
    let digest = Sha256::digest(number.as_bytes());
    STANDARD_NO_PAD.encode(&digest[..TOKEN_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAccount;

    #[test]
    fn test_contact_token() {
        let token = contact_token("+15551234567");
        // 10 bytes encode to 14 characters without padding
        assert_eq!(token.len(), 14);
        assert!(!token.ends_with('='));
        assert_eq!(token, contact_token("+15551234567"));
        assert_ne!(token, contact_token("+15557654321"));
    }

    #[tokio::test]
    async fn test_refresh_records_registered_contacts() {
        let account = RecordingAccount {
            registered_tokens: [contact_token("+15550000001")].into_iter().collect(),
            ..Default::default()
        };
        let sync = DirectorySync::new(["+15550000001".to_string(), "+15550000002".to_string()]);

        let count = sync.refresh(&account).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(sync.registered(), vec!["+15550000001".to_string()]);
        assert_eq!(account.directory_queries.lock()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_with_no_contacts() {
        let account = RecordingAccount::default();
        let sync = DirectorySync::default();

        assert_eq!(sync.refresh(&account).await.unwrap(), 0);
        assert!(sync.registered().is_empty());
    }
}
