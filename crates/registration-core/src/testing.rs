//! Test doubles shared by the unit tests.

use crate::account::{AccountClient, AccountClientFactory, Credentials};
use crate::error::AccountError;
use crate::keys::{IdentityKey, PreKeyRecord, SignedPreKeyRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RequestSms,
    Verify {
        code: String,
        registration_id: u32,
        voice_only: bool,
    },
    SetPreKeys {
        count: usize,
    },
    SetSignedPreKey {
        id: u32,
    },
    SetPushToken(Option<String>),
    RefreshDirectory {
        count: usize,
    },
}

/// Scriptable account client that records every call.
#[derive(Default)]
pub struct FakeAccount {
    calls: Mutex<Vec<Call>>,
    connections: Mutex<Vec<String>>,
    request_error: Mutex<Option<AccountError>>,
    verify_error: Mutex<Option<AccountError>>,
    panic_on_request: AtomicBool,
    hold_request: AtomicBool,
    /// Signalled when a held SMS request starts
    pub requested: Notify,
    /// Lets a held SMS request finish
    pub release: Notify,
}

impl FakeAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_error(self, error: AccountError) -> Self {
        *self.request_error.lock() = Some(error);
        self
    }

    pub fn with_verify_error(self, error: AccountError) -> Self {
        *self.verify_error.lock() = Some(error);
        self
    }

    pub fn panicking(self) -> Self {
        self.panic_on_request.store(true, Ordering::SeqCst);
        self
    }

    /// Block SMS requests until `release` is notified.
    pub fn holding(self) -> Self {
        self.hold_request.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn connections(&self) -> Vec<String> {
        self.connections.lock().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl AccountClient for FakeAccount {
    async fn request_sms_verification_code(&self) -> Result<(), AccountError> {
        self.record(Call::RequestSms);
        if self.panic_on_request.load(Ordering::SeqCst) {
            panic!("account client exploded");
        }
        if self.hold_request.load(Ordering::SeqCst) {
            self.requested.notify_one();
            self.release.notified().await;
        }
        match self.request_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn verify_account_with_code(
        &self,
        code: &str,
        _signaling_key: &SecretString,
        registration_id: u32,
        voice_only: bool,
    ) -> Result<(), AccountError> {
        self.record(Call::Verify {
            code: code.to_string(),
            registration_id,
            voice_only,
        });
        match self.verify_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn set_pre_keys(
        &self,
        _identity_key: &IdentityKey,
        _signed_pre_key: &SignedPreKeyRecord,
        pre_keys: &[PreKeyRecord],
    ) -> Result<(), AccountError> {
        self.record(Call::SetPreKeys {
            count: pre_keys.len(),
        });
        Ok(())
    }

    async fn set_signed_pre_key(&self, signed_pre_key: &SignedPreKeyRecord) -> Result<(), AccountError> {
        self.record(Call::SetSignedPreKey {
            id: signed_pre_key.id,
        });
        Ok(())
    }

    async fn set_push_token(&self, token: Option<&str>) -> Result<(), AccountError> {
        self.record(Call::SetPushToken(token.map(str::to_string)));
        Ok(())
    }

    async fn refresh_directory(&self, tokens: &[String]) -> Result<Vec<String>, AccountError> {
        self.record(Call::RefreshDirectory {
            count: tokens.len(),
        });
        Ok(Vec::new())
    }
}

/// Hands out the same [`FakeAccount`] for every set of credentials.
pub struct FakeAccountFactory(pub Arc<FakeAccount>);

impl AccountClientFactory for FakeAccountFactory {
    fn connect(&self, credentials: Credentials) -> Arc<dyn AccountClient> {
        self.0.connections.lock().push(credentials.number);
        self.0.clone()
    }
}
