//! Configuration for the registration service.

use anyhow::{Context, Result};
use registration_core::RegistrationConfig;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Account service configuration
    #[serde(default)]
    pub account: AccountConfig,

    /// Registration state machine tuning
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Local store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Push token configuration
    #[serde(default)]
    pub push: PushConfig,

    /// Follow-up job intervals
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Contacts checked against the directory
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account service base URL
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the encrypted store file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Enable persistence (if false, the store is in-memory only)
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Secret the file encryption key is derived from
    #[serde(default)]
    pub secret: Option<SecretString>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushConfig {
    /// Push token registered with the account service; push is reported as
    /// unsupported without one
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_directory_refresh", with = "humantime_serde")]
    pub directory_refresh_interval: Duration,

    #[serde(default = "default_signed_pre_key_rotation", with = "humantime_serde")]
    pub signed_pre_key_rotation_interval: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    /// Comma-separated E.164 numbers
    #[serde(default)]
    pub contacts: String,
}

impl DirectoryConfig {
    pub fn contact_list(&self) -> Vec<String> {
        self.contacts
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Global requests per minute
    #[serde(default = "default_global_rpm")]
    pub global_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            timeout: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            persist: true,
            secret: None,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            directory_refresh_interval: default_directory_refresh(),
            signed_pre_key_rotation_interval: default_signed_pre_key_rotation(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_minute: default_global_rpm(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_service_url() -> String {
    "https://textsecure-service.whispersystems.org".into()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    concat!("registration-service/", env!("CARGO_PKG_VERSION")).into()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/data/registration.enc")
}

fn default_true() -> bool {
    true
}

fn default_directory_refresh() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_signed_pre_key_rotation() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_listen_addr() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8081
}

fn default_global_rpm() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(false),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
