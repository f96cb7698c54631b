//! Account service double for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use registration_core::{
    AccountClient, AccountClientFactory, AccountError, Credentials, IdentityKey, PreKeyRecord,
    SignedPreKeyRecord,
};
use secrecy::SecretString;
use std::collections::HashSet;
use std::sync::Arc;

/// Records uploads and answers directory queries from a fixed set.
#[derive(Default)]
pub struct RecordingAccount {
    pub registered_tokens: HashSet<String>,
    pub signed_pre_keys: Mutex<Vec<u32>>,
    pub directory_queries: Mutex<Vec<Vec<String>>>,
    pub connections: Mutex<Vec<String>>,
}

#[async_trait]
impl AccountClient for RecordingAccount {
    async fn request_sms_verification_code(&self) -> Result<(), AccountError> {
        Ok(())
    }

    async fn verify_account_with_code(
        &self,
        _code: &str,
        _signaling_key: &SecretString,
        _registration_id: u32,
        _voice_only: bool,
    ) -> Result<(), AccountError> {
        Ok(())
    }

    async fn set_pre_keys(
        &self,
        _identity_key: &IdentityKey,
        _signed_pre_key: &SignedPreKeyRecord,
        _pre_keys: &[PreKeyRecord],
    ) -> Result<(), AccountError> {
        Ok(())
    }

    async fn set_signed_pre_key(&self, signed_pre_key: &SignedPreKeyRecord) -> Result<(), AccountError> {
        self.signed_pre_keys.lock().push(signed_pre_key.id);
        Ok(())
    }

    async fn set_push_token(&self, _token: Option<&str>) -> Result<(), AccountError> {
        Ok(())
    }

    async fn refresh_directory(&self, tokens: &[String]) -> Result<Vec<String>, AccountError> {
        self.directory_queries.lock().push(tokens.to_vec());
        Ok(tokens
            .iter()
            .filter(|t| self.registered_tokens.contains(*t))
            .cloned()
            .collect())
    }
}

pub struct RecordingFactory(pub Arc<RecordingAccount>);

impl AccountClientFactory for RecordingFactory {
    fn connect(&self, credentials: Credentials) -> Arc<dyn AccountClient> {
        self.0.connections.lock().push(credentials.number);
        self.0.clone()
    }
}
