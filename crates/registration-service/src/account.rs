//! HTTP client for a Signal-style account service.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use registration_core::{
    AccountClient, AccountClientFactory, AccountError, Credentials, IdentityKey, PreKeyRecord,
    SignedPreKeyRecord,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use urlencoding::encode;

/// Builds [`HttpAccountClient`]s that share one connection pool.
#[derive(Clone)]
pub struct HttpAccountClientFactory {
    client: Client,
    base_url: String,
}

impl HttpAccountClientFactory {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, AccountError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| AccountError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn client(&self, credentials: Credentials) -> HttpAccountClient {
        HttpAccountClient {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            credentials,
        }
    }
}

impl AccountClientFactory for HttpAccountClientFactory {
    fn connect(&self, credentials: Credentials) -> Arc<dyn AccountClient> {
        Arc::new(self.client(credentials))
    }
}

/// Account service client authenticated as one number.
pub struct HttpAccountClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountAttributes<'a> {
    signaling_key: &'a str,
    registration_id: u32,
    voice: bool,
    fetches_messages: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreKeyEntity {
    key_id: u32,
    public_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedPreKeyEntity {
    key_id: u32,
    public_key: String,
    signature: String,
}

impl From<&SignedPreKeyRecord> for SignedPreKeyEntity {
    fn from(record: &SignedPreKeyRecord) -> Self {
        Self {
            key_id: record.id,
            public_key: STANDARD_NO_PAD.encode(record.key_pair.public_key()),
            signature: STANDARD_NO_PAD.encode(record.signature),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreKeyState {
    identity_key: String,
    pre_keys: Vec<PreKeyEntity>,
    signed_pre_key: SignedPreKeyEntity,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushTokenRegistration<'a> {
    gcm_registration_id: &'a str,
    web_socket_channel: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContactTokens {
    contacts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ContactTokenDetails {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ContactTokenDetailsList {
    #[serde(default)]
    contacts: Vec<ContactTokenDetails>,
}

impl HttpAccountClient {
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(
            &self.credentials.number,
            Some(self.credentials.password.expose_secret()),
        )
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response, AccountError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| AccountError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(%status, body = %body, operation, "Account service request failed");
        Err(map_status(status, body))
    }
}

fn map_status(status: StatusCode, body: String) -> AccountError {
    match status.as_u16() {
        401 | 403 => AccountError::Unauthorized,
        413 | 429 => AccountError::RateLimited,
        417 => AccountError::Conflict,
        code => AccountError::Status { status: code, body },
    }
}

#[async_trait]
impl AccountClient for HttpAccountClient {
    #[instrument(skip(self), fields(phone_number = %self.credentials.number))]
    async fn request_sms_verification_code(&self) -> Result<(), AccountError> {
        let url = format!(
            "{}/v1/accounts/sms/code/{}",
            self.base_url,
            encode(&self.credentials.number)
        );

        self.send(self.client.get(&url), "request_sms_verification_code")
            .await?;
        debug!("Verification code requested");
        Ok(())
    }

    #[instrument(skip(self, code, signaling_key), fields(phone_number = %self.credentials.number))]
    async fn verify_account_with_code(
        &self,
        code: &str,
        signaling_key: &SecretString,
        registration_id: u32,
        voice_only: bool,
    ) -> Result<(), AccountError> {
        let url = format!("{}/v1/accounts/code/{}", self.base_url, encode(code));
        let attributes = AccountAttributes {
            signaling_key: signaling_key.expose_secret(),
            registration_id,
            voice: voice_only,
            fetches_messages: true,
        };

        self.send(self.client.put(&url).json(&attributes), "verify_account_with_code")
            .await?;
        debug!("Account verified");
        Ok(())
    }

    #[instrument(skip_all, fields(phone_number = %self.credentials.number, count = pre_keys.len()))]
    async fn set_pre_keys(
        &self,
        identity_key: &IdentityKey,
        signed_pre_key: &SignedPreKeyRecord,
        pre_keys: &[PreKeyRecord],
    ) -> Result<(), AccountError> {
        let url = format!("{}/v2/keys/", self.base_url);
        let state = PreKeyState {
            identity_key: STANDARD_NO_PAD.encode(identity_key.as_bytes()),
            pre_keys: pre_keys
                .iter()
                .map(|record| PreKeyEntity {
                    key_id: record.id,
                    public_key: STANDARD_NO_PAD.encode(record.key_pair.public_key()),
                })
                .collect(),
            signed_pre_key: signed_pre_key.into(),
        };

        self.send(self.client.put(&url).json(&state), "set_pre_keys")
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(phone_number = %self.credentials.number, id = signed_pre_key.id))]
    async fn set_signed_pre_key(&self, signed_pre_key: &SignedPreKeyRecord) -> Result<(), AccountError> {
        let url = format!("{}/v2/keys/signed", self.base_url);
        let entity = SignedPreKeyEntity::from(signed_pre_key);

        self.send(self.client.put(&url).json(&entity), "set_signed_pre_key")
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(phone_number = %self.credentials.number, register = token.is_some()))]
    async fn set_push_token(&self, token: Option<&str>) -> Result<(), AccountError> {
        let url = format!("{}/v1/accounts/gcm", self.base_url);
        let request = match token {
            Some(token) => self.client.put(&url).json(&PushTokenRegistration {
                gcm_registration_id: token,
                web_socket_channel: true,
            }),
            None => self.client.delete(&url),
        };

        self.send(request, "set_push_token").await?;
        Ok(())
    }

    #[instrument(skip_all, fields(phone_number = %self.credentials.number, count = tokens.len()))]
    async fn refresh_directory(&self, tokens: &[String]) -> Result<Vec<String>, AccountError> {
        let url = format!("{}/v1/directory/tokens", self.base_url);
        let body = ContactTokens {
            contacts: tokens.to_vec(),
        };

        let response = self
            .send(self.client.put(&url).json(&body), "refresh_directory")
            .await?;
        let details: ContactTokenDetailsList = response.json().await.map_err(|e| {
            AccountError::Transport(format!("Failed to parse directory response: {}", e))
        })?;

        Ok(details.contacts.into_iter().map(|c| c.token).collect())
    }
}
