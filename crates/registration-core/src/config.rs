//! Registration tuning.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// How long to wait for the SMS challenge
    #[serde(default = "default_challenge_timeout", with = "humantime_serde")]
    pub challenge_timeout: Duration,

    /// One-time pre-keys uploaded per registration
    #[serde(default = "default_pre_key_batch_size")]
    pub pre_key_batch_size: usize,

    /// Buffered terminal notifications per subscriber
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            challenge_timeout: default_challenge_timeout(),
            pre_key_batch_size: default_pre_key_batch_size(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

fn default_challenge_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_pre_key_batch_size() -> usize {
    crate::keys::PRE_KEY_BATCH_SIZE
}

fn default_notification_capacity() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistrationConfig::default();
        assert_eq!(config.challenge_timeout, Duration::from_secs(120));
        assert_eq!(config.pre_key_batch_size, 100);
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: RegistrationConfig =
            serde_json::from_str(r#"{"challenge_timeout": "90s"}"#).unwrap();
        assert_eq!(config.challenge_timeout, Duration::from_secs(90));
        assert_eq!(config.notification_capacity, 16);
    }
}
