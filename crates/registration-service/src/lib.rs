//! Registration host - runs the device registration state machine behind an HTTP API.
//!
//! The service:
//! - Drives SMS and voice registrations against the account service
//! - Persists preferences and keys in an encrypted local file
//! - Runs directory refresh and signed pre-key rotation once registered

pub mod account;
pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod jobs;
pub mod phone;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use account::{HttpAccountClient, HttpAccountClientFactory};
pub use config::Config;
pub use directory::DirectorySync;
pub use error::ServiceError;
pub use jobs::{JobContext, TokioJobScheduler};
pub use service::Service;
pub use store::{open_store, EncryptedFile};
