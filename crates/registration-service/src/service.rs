//! Wiring of the state machine and its collaborators.

use crate::config::Config;
use crate::directory::DirectorySync;
use crate::jobs::{JobContext, TokioJobScheduler};
use registration_core::{
    AccountClientFactory, Collaborators, JobScheduler, KeyProvisioner, LocalStore, PeriodicJob,
    PreferencesStore, RegistrationResult, RegistrationStateMachine, StaticPushTokenProvider,
};
use std::sync::Arc;
use tracing::info;

/// A running registration host.
pub struct Service {
    pub machine: Arc<RegistrationStateMachine>,
    pub jobs: Arc<TokioJobScheduler>,
    pub directory: DirectorySync,
    pub store: Arc<LocalStore>,
}

impl Service {
    /// Build the state machine on top of `store` and `accounts`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(
        config: &Config,
        store: Arc<LocalStore>,
        accounts: Arc<dyn AccountClientFactory>,
    ) -> Self {
        let keys = Arc::new(KeyProvisioner::new(
            store.clone(),
            config.registration.pre_key_batch_size,
        ));
        let directory = DirectorySync::new(config.directory.contact_list());

        let jobs = Arc::new(TokioJobScheduler::new(
            JobContext {
                preferences: store.clone(),
                accounts: accounts.clone(),
                keys: keys.clone(),
                directory: Arc::new(directory.clone()),
            },
            config.jobs.clone(),
        ));

        let collaborators = Collaborators {
            accounts,
            preferences: store.clone(),
            identities: store.clone(),
            keys,
            push: Arc::new(StaticPushTokenProvider::new(config.push.token.clone())),
            directory: Arc::new(directory.clone()),
            jobs: jobs.clone(),
        };

        let machine = Arc::new(RegistrationStateMachine::new(
            config.registration.clone(),
            collaborators,
        ));

        Self {
            machine,
            jobs,
            directory,
            store,
        }
    }

    /// Restart follow-up jobs for a device registered in an earlier run.
    pub async fn resume_jobs(&self) -> RegistrationResult<()> {
        let prefs = self.store.preferences().await?;
        if prefs.push_registered {
            info!("Device already registered, resuming periodic jobs");
            self.jobs.schedule(PeriodicJob::DirectoryRefresh);
            self.jobs.schedule(PeriodicJob::RotateSignedPreKey);
        }
        Ok(())
    }
}
