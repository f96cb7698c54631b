//! Fire-and-forget collaborators and the push token source.

use crate::account::AccountClient;
use crate::error::AccountError;
use async_trait::async_trait;
use std::sync::Arc;

/// Source of push tokens for this device.
#[async_trait]
pub trait PushTokenProvider: Send + Sync {
    /// Fails with [`AccountError::Unsupported`] when the device cannot
    /// receive push messages.
    async fn ensure_available(&self) -> Result<(), AccountError>;

    /// Obtain a push token.
    async fn register(&self) -> Result<String, AccountError>;
}

/// Push provider backed by a fixed token.
///
/// Without a token every call reports push as unsupported.
#[derive(Debug, Clone, Default)]
pub struct StaticPushTokenProvider {
    token: Option<String>,
}

impl StaticPushTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self::new(Some(token.into()))
    }

    pub fn unsupported() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl PushTokenProvider for StaticPushTokenProvider {
    async fn ensure_available(&self) -> Result<(), AccountError> {
        match self.token {
            Some(_) => Ok(()),
            None => Err(AccountError::Unsupported("no push token configured".into())),
        }
    }

    async fn register(&self) -> Result<String, AccountError> {
        self.token
            .clone()
            .ok_or_else(|| AccountError::Unsupported("no push token configured".into()))
    }
}

/// Refreshes the contact directory after registration.
#[cfg_attr(test, mockall::automock)]
pub trait DirectoryRefresher: Send + Sync {
    fn refresh_directory(&self, account: Arc<dyn AccountClient>);
}

/// Recurring background work scheduled once registration completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodicJob {
    DirectoryRefresh,
    RotateSignedPreKey,
}

impl PeriodicJob {
    pub fn name(&self) -> &'static str {
        match self {
            PeriodicJob::DirectoryRefresh => "directory_refresh",
            PeriodicJob::RotateSignedPreKey => "rotate_signed_pre_key",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait JobScheduler: Send + Sync {
    fn schedule(&self, job: PeriodicJob);
}
