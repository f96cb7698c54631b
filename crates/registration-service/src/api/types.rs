//! API request and response types.

use registration_core::{Phase, RegistrationState};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Request to register a number with an SMS challenge.
#[derive(Debug, Deserialize)]
pub struct SmsRegistrationRequest {
    pub number: String,

    /// Whether this device can receive push messages
    #[serde(default = "default_true")]
    pub supports_push: bool,
}

/// Record that the user asked for a voice call.
#[derive(Debug, Deserialize)]
pub struct VoiceRequestedRequest {
    pub number: String,

    /// Password of the attempt the voice call continues
    pub password: SecretString,
}

/// Finish a registration verified by voice call.
#[derive(Debug, Deserialize)]
pub struct VoiceRegistrationRequest {
    pub number: String,
    pub password: SecretString,
    pub signaling_key: SecretString,

    #[serde(default = "default_true")]
    pub supports_push: bool,
}

/// Inbound verification code.
#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    pub code: String,
}

/// Response to a queued action.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: String,
    pub action: String,
    pub phone_number: Option<String>,
}

impl AcceptedResponse {
    pub fn new(action: &str, phone_number: Option<String>) -> Self {
        Self {
            status: "accepted".into(),
            action: action.into(),
            phone_number,
        }
    }
}

/// Current registration state. The password is never exposed.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub phase: Phase,
    pub number: Option<String>,
    pub seconds_remaining: u64,
}

impl StateResponse {
    pub fn new(state: RegistrationState, seconds_remaining: u64) -> Self {
        Self {
            phase: state.phase,
            number: state.number,
            seconds_remaining,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub phase: Phase,
    pub registered_contacts: usize,
}
