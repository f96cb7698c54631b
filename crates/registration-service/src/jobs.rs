//! Periodic follow-up jobs scheduled after registration.

use crate::config::JobsConfig;
use parking_lot::Mutex;
use registration_core::{
    AccountClientFactory, Credentials, DirectoryRefresher, JobScheduler, KeyProvisioner,
    PeriodicJob, PreferencesStore, RegistrationResult,
};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Dependencies of the periodic jobs.
pub struct JobContext {
    pub preferences: Arc<dyn PreferencesStore>,
    pub accounts: Arc<dyn AccountClientFactory>,
    pub keys: Arc<KeyProvisioner>,
    pub directory: Arc<dyn DirectoryRefresher>,
}

impl JobContext {
    /// Credentials of the registered account, if there is one.
    async fn credentials(&self) -> RegistrationResult<Option<Credentials>> {
        let prefs = self.preferences.preferences().await?;
        if !prefs.push_registered {
            return Ok(None);
        }

        Ok(match (prefs.local_number, prefs.push_server_password) {
            (Some(number), Some(password)) => {
                Some(Credentials::new(number, SecretString::new(password)))
            }
            _ => None,
        })
    }

    /// Run one job now.
    pub async fn run(&self, job: PeriodicJob) -> RegistrationResult<()> {
        let Some(credentials) = self.credentials().await? else {
            warn!(job = job.name(), "Skipping job, device is not registered");
            return Ok(());
        };
        let account = self.accounts.connect(credentials);

        match job {
            PeriodicJob::DirectoryRefresh => {
                self.directory.refresh_directory(account);
            }
            PeriodicJob::RotateSignedPreKey => {
                self.keys.rotate_signed_pre_key(account.as_ref()).await?;
                self.preferences
                    .update_preferences(Box::new(|p| p.signed_pre_key_registered = true))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Runs each job kind on its own interval task.
pub struct TokioJobScheduler {
    context: Arc<JobContext>,
    config: JobsConfig,
    tasks: Mutex<HashMap<PeriodicJob, JoinHandle<()>>>,
}

impl TokioJobScheduler {
    pub fn new(context: JobContext, config: JobsConfig) -> Self {
        Self {
            context: Arc::new(context),
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn period(&self, job: PeriodicJob) -> Duration {
        match job {
            PeriodicJob::DirectoryRefresh => self.config.directory_refresh_interval,
            PeriodicJob::RotateSignedPreKey => self.config.signed_pre_key_rotation_interval,
        }
    }

    pub fn is_scheduled(&self, job: PeriodicJob) -> bool {
        self.tasks.lock().contains_key(&job)
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule(&self, job: PeriodicJob) {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&job) {
            debug!(job = job.name(), "Job already scheduled");
            return;
        }

        let period = self.period(job);
        let context = self.context.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticks.tick().await;
                debug!(job = job.name(), "Running periodic job");
                if let Err(e) = context.run(job).await {
                    warn!(job = job.name(), error = %e, "Periodic job failed");
                }
            }
        });

        info!(job = job.name(), ?period, "Scheduled periodic job");
        tasks.insert(job, handle);
    }
}

impl Drop for TokioJobScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
