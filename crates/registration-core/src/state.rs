//! Registration state model.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing running; initial state and the state restored by shutdown
    Idle,
    /// A voice call was requested, number and password are retained
    VoiceRequested,
    /// Requesting an SMS verification code
    Connecting,
    /// Waiting for the SMS challenge
    Verifying,
    /// Generating and uploading key material
    GeneratingKeys,
    /// Registering for push delivery
    GcmRegistering,
    /// Registration finished successfully
    Complete,
    /// No challenge arrived in time
    Timeout,
    /// Network or I/O failure
    NetworkError,
    /// This device cannot receive push messages
    GcmUnsupported,
    /// The number is registered on another device
    MultiRegistered,
}

impl Phase {
    /// Whether this phase ends an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Complete
                | Phase::Timeout
                | Phase::NetworkError
                | Phase::GcmUnsupported
                | Phase::MultiRegistered
        )
    }
}

/// Immutable snapshot of the registration state.
///
/// A fresh value is published on every transition.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrationState {
    pub phase: Phase,
    pub number: Option<String>,
    /// Push server password, kept on `VoiceRequested` and `Timeout` so a
    /// voice call can reuse it.
    pub password: Option<String>,
}

impl RegistrationState {
    pub fn idle() -> Self {
        Self::new(Phase::Idle, None)
    }

    pub fn new(phase: Phase, number: Option<String>) -> Self {
        Self {
            phase,
            number,
            password: None,
        }
    }

    pub fn with_password(phase: Phase, number: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            phase,
            number: Some(number.into()),
            password: Some(password.into()),
        }
    }

    pub fn for_number(phase: Phase, number: &str) -> Self {
        Self::new(phase, Some(number.to_string()))
    }
}

impl Default for RegistrationState {
    fn default() -> Self {
        Self::idle()
    }
}

impl fmt::Debug for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationState")
            .field("phase", &self.phase)
            .field("number", &self.number)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Work submitted to the registration worker.
#[derive(Debug)]
pub enum RegistrationAction {
    /// Register the number and prove control of it with an SMS challenge.
    RegisterSms { number: String, supports_push: bool },

    /// Record that the user asked for a voice call instead.
    VoiceRequested {
        number: String,
        password: SecretString,
    },

    /// Finish a registration whose number was verified by voice.
    VoiceRegister {
        number: String,
        password: SecretString,
        signaling_key: SecretString,
        supports_push: bool,
    },
}

impl RegistrationAction {
    pub fn number(&self) -> &str {
        match self {
            RegistrationAction::RegisterSms { number, .. }
            | RegistrationAction::VoiceRequested { number, .. }
            | RegistrationAction::VoiceRegister { number, .. } => number,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegistrationAction::RegisterSms { .. } => "register_sms",
            RegistrationAction::VoiceRequested { .. } => "voice_requested",
            RegistrationAction::VoiceRegister { .. } => "voice_register",
        }
    }
}

/// Broadcast sent once per terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationNotification {
    pub success: bool,
    pub title: String,
    pub body: String,
}

impl RegistrationNotification {
    pub fn complete() -> Self {
        Self {
            success: true,
            title: "Registration complete".into(),
            body: "Signal registration has successfully completed".into(),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            title: "Registration error".into(),
            body: "Signal registration has encountered a problem".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        let terminal = [
            Phase::Complete,
            Phase::Timeout,
            Phase::NetworkError,
            Phase::GcmUnsupported,
            Phase::MultiRegistered,
        ];
        for phase in terminal {
            assert!(phase.is_terminal(), "{:?}", phase);
        }

        let running = [
            Phase::Idle,
            Phase::VoiceRequested,
            Phase::Connecting,
            Phase::Verifying,
            Phase::GeneratingKeys,
            Phase::GcmRegistering,
        ];
        for phase in running {
            assert!(!phase.is_terminal(), "{:?}", phase);
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let state = RegistrationState::with_password(Phase::Timeout, "+15551234567", "hunter2");
        let debug = format!("{:?}", state);

        assert!(debug.contains("+15551234567"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&Phase::GcmRegistering).unwrap();
        assert_eq!(json, "\"gcm_registering\"");

        let json = serde_json::to_string(&Phase::MultiRegistered).unwrap();
        assert_eq!(json, "\"multi_registered\"");
    }

    #[test]
    fn test_action_number_and_kind() {
        let action = RegistrationAction::VoiceRequested {
            number: "+15551234567".into(),
            password: SecretString::new("pw".into()),
        };
        assert_eq!(action.number(), "+15551234567");
        assert_eq!(action.kind(), "voice_requested");
        assert!(!format!("{:?}", action).contains("\"pw\""));
    }
}
