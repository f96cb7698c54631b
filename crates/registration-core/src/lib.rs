//! Device registration and phone number verification.
//!
//! [`RegistrationStateMachine`] provisions the device identity and proves
//! control of a phone number to the account service, by SMS challenge or by
//! a voice call verified upstream. Everything it talks to sits behind a
//! trait so hosts can supply their own transport and storage.

mod account;
mod challenge;
mod collaborators;
mod config;
mod error;
mod keys;
mod machine;
mod secrets;
mod state;
mod store;

#[cfg(test)]
mod testing;

pub use account::{AccountClient, AccountClientFactory, Credentials};
pub use challenge::ChallengeWaiter;
pub use collaborators::{
    DirectoryRefresher, JobScheduler, PeriodicJob, PushTokenProvider, StaticPushTokenProvider,
};
pub use config::RegistrationConfig;
pub use error::{
    AccountError, ChallengeError, KeyError, RegistrationError, RegistrationResult, StoreError,
};
pub use keys::{
    IdentityKey, IdentityKeyPair, KeyProvisioner, PreKeyBundle, PreKeyPair, PreKeyRecord,
    SignedPreKeyRecord, MEDIUM_MAX_VALUE, PRE_KEY_BATCH_SIZE,
};
pub use machine::{Collaborators, RegistrationStateMachine};
pub use secrets::{
    generate_registration_id, generate_secret, MAX_REGISTRATION_ID, PASSWORD_BYTES,
    SIGNALING_KEY_BYTES,
};
pub use state::{Phase, RegistrationAction, RegistrationNotification, RegistrationState};
pub use store::{
    Document, IdentitySessionStore, KeyState, KeyStore, LocalStore, Persistence, Preferences,
    PreferencesStore, PreferencesUpdate, StoredSignedPreKey, VerifiedIdentity, VerifiedStatus,
    SIGNED_PRE_KEY_RETENTION,
};
