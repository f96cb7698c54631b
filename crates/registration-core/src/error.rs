//! Registration error types.

use crate::state::Phase;
use thiserror::Error;

/// Errors reported by the remote account service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("Number is already registered and verified elsewhere")]
    Conflict,

    #[error("Push messaging unsupported: {0}")]
    Unsupported(String),

    #[error("Account service rejected credentials")]
    Unauthorized,

    #[error("Rate limited by account service")]
    RateLimited,

    #[error("Account service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Local storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Key provisioning errors.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Key storage error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a challenge wait that produced no code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("Timed out waiting for verification challenge")]
    Timeout,

    #[error("Challenge wait cancelled")]
    Cancelled,
}

/// Any failure that ends a registration attempt.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Key error: {0}")]
    Keys(#[from] KeyError),

    #[error("Registration worker failure: {0}")]
    Internal(String),
}

impl RegistrationError {
    /// Terminal phase this failure ends the attempt in.
    ///
    /// `None` means the attempt was cancelled and must not publish anything.
    pub fn terminal_phase(&self) -> Option<Phase> {
        match self {
            RegistrationError::Account(AccountError::Conflict) => Some(Phase::MultiRegistered),
            RegistrationError::Account(AccountError::Unsupported(_)) => {
                Some(Phase::GcmUnsupported)
            }
            RegistrationError::Challenge(ChallengeError::Timeout) => Some(Phase::Timeout),
            RegistrationError::Challenge(ChallengeError::Cancelled) => None,
            _ => Some(Phase::NetworkError),
        }
    }
}

/// Result type alias for registration operations.
pub type RegistrationResult<T> = Result<T, RegistrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phase_mapping() {
        assert_eq!(
            RegistrationError::from(AccountError::Conflict).terminal_phase(),
            Some(Phase::MultiRegistered)
        );
        assert_eq!(
            RegistrationError::from(AccountError::Unsupported("no play services".into()))
                .terminal_phase(),
            Some(Phase::GcmUnsupported)
        );
        assert_eq!(
            RegistrationError::from(ChallengeError::Timeout).terminal_phase(),
            Some(Phase::Timeout)
        );
        assert_eq!(
            RegistrationError::from(ChallengeError::Cancelled).terminal_phase(),
            None
        );
    }

    #[test]
    fn test_everything_else_is_network_error() {
        let errors = vec![
            RegistrationError::from(AccountError::Transport("connection reset".into())),
            RegistrationError::from(AccountError::RateLimited),
            RegistrationError::from(AccountError::Unauthorized),
            RegistrationError::from(StoreError::Io("disk full".into())),
            RegistrationError::from(KeyError::InvalidKey("short".into())),
            RegistrationError::Internal("panicked".into()),
        ];

        for error in errors {
            assert_eq!(error.terminal_phase(), Some(Phase::NetworkError), "{}", error);
        }
    }
}
