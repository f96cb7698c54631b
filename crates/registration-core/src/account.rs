//! Remote account service interface.

use crate::error::AccountError;
use crate::keys::{IdentityKey, PreKeyRecord, SignedPreKeyRecord};
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;

/// Number and push server password used to authenticate with the account
/// service.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub number: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(number: impl Into<String>, password: SecretString) -> Self {
        Self {
            number: number.into(),
            password,
        }
    }
}

/// Account service operations, bound to one set of credentials.
#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Ask the service to send an SMS challenge to the bound number.
    async fn request_sms_verification_code(&self) -> Result<(), AccountError>;

    /// Prove control of the number with the received challenge.
    ///
    /// Fails with [`AccountError::Conflict`] when the number is already
    /// verified on another device.
    async fn verify_account_with_code(
        &self,
        code: &str,
        signaling_key: &SecretString,
        registration_id: u32,
        voice_only: bool,
    ) -> Result<(), AccountError>;

    /// Upload the identity key and pre-keys.
    async fn set_pre_keys(
        &self,
        identity_key: &IdentityKey,
        signed_pre_key: &SignedPreKeyRecord,
        pre_keys: &[PreKeyRecord],
    ) -> Result<(), AccountError>;

    /// Replace the advertised signed pre-key.
    async fn set_signed_pre_key(&self, signed_pre_key: &SignedPreKeyRecord) -> Result<(), AccountError>;

    /// Register a push token, or remove it with `None`.
    async fn set_push_token(&self, token: Option<&str>) -> Result<(), AccountError>;

    /// Return the subset of `tokens` belonging to registered users.
    async fn refresh_directory(&self, tokens: &[String]) -> Result<Vec<String>, AccountError>;
}

/// Creates account clients for a set of credentials.
pub trait AccountClientFactory: Send + Sync {
    fn connect(&self, credentials: Credentials) -> Arc<dyn AccountClient>;
}
