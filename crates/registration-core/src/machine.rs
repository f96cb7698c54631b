//! Registration state machine.
//!
//! Actions are processed one at a time, in submission order, by a single
//! worker task. Every transition publishes a complete [`RegistrationState`]
//! snapshot. [`RegistrationStateMachine::shutdown`] bumps an epoch that each
//! flow re-checks whenever it publishes or persists, so a cancelled flow can
//! never write a non-idle state or registration data after shutdown has been
//! observed.

use crate::account::{AccountClient, AccountClientFactory, Credentials};
use crate::challenge::ChallengeWaiter;
use crate::collaborators::{DirectoryRefresher, JobScheduler, PeriodicJob, PushTokenProvider};
use crate::config::RegistrationConfig;
use crate::error::{ChallengeError, RegistrationError, RegistrationResult, StoreError};
use crate::keys::KeyProvisioner;
use crate::secrets::{generate_registration_id, generate_secret, PASSWORD_BYTES, SIGNALING_KEY_BYTES};
use crate::state::{Phase, RegistrationAction, RegistrationNotification, RegistrationState};
use crate::store::{IdentitySessionStore, Preferences, PreferencesStore};
use futures::FutureExt;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Everything the state machine delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub accounts: Arc<dyn AccountClientFactory>,
    pub preferences: Arc<dyn PreferencesStore>,
    pub identities: Arc<dyn IdentitySessionStore>,
    pub keys: Arc<KeyProvisioner>,
    pub push: Arc<dyn PushTokenProvider>,
    pub directory: Arc<dyn DirectoryRefresher>,
    pub jobs: Arc<dyn JobScheduler>,
}

/// Secrets and settings for one run of a flow.
struct RegistrationAttempt {
    number: String,
    password: SecretString,
    signaling_key: SecretString,
    supports_push: bool,
}

impl RegistrationAttempt {
    fn fresh(number: String, supports_push: bool) -> Self {
        Self {
            number,
            password: generate_secret(PASSWORD_BYTES),
            signaling_key: generate_secret(SIGNALING_KEY_BYTES),
            supports_push,
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(self.number.clone(), self.password.clone())
    }
}

struct Submission {
    epoch: u64,
    action: RegistrationAction,
}

struct Shared {
    config: RegistrationConfig,
    collaborators: Collaborators,
    state: watch::Sender<RegistrationState>,
    epoch: Arc<AtomicU64>,
    waiter: ChallengeWaiter,
    observer: Mutex<Option<mpsc::UnboundedSender<RegistrationState>>>,
    notifications: broadcast::Sender<RegistrationNotification>,
}

/// Orchestrates device registration.
pub struct RegistrationStateMachine {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Submission>,
}

impl RegistrationStateMachine {
    /// Create the machine and spawn its worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: RegistrationConfig, collaborators: Collaborators) -> Self {
        let (state, _) = watch::channel(RegistrationState::idle());
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        let (queue, receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config,
            collaborators,
            state,
            epoch: Arc::new(AtomicU64::new(0)),
            waiter: ChallengeWaiter::new(),
            observer: Mutex::new(None),
            notifications,
        });

        tokio::spawn(run_worker(shared.clone(), receiver));

        Self { shared, queue }
    }

    /// Queue an action behind whatever is already running.
    pub fn submit(&self, action: RegistrationAction) -> RegistrationResult<()> {
        debug!(action = action.kind(), "Queueing registration action");
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.queue
            .send(Submission { epoch, action })
            .map_err(|_| RegistrationError::Internal("registration worker stopped".into()))
    }

    /// Latest published state.
    pub fn state(&self) -> RegistrationState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that always holds the latest state.
    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.shared.state.subscribe()
    }

    /// Seconds left in the challenge wait in progress, `0` when not waiting.
    pub fn seconds_remaining(&self) -> u64 {
        self.shared.waiter.seconds_remaining()
    }

    /// Replace the state observer. `None` detaches the current one.
    ///
    /// The observer receives every published state, in order.
    pub fn set_observer(&self, observer: Option<mpsc::UnboundedSender<RegistrationState>>) {
        *self.shared.observer.lock() = observer;
    }

    /// Terminal success and failure notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<RegistrationNotification> {
        self.shared.notifications.subscribe()
    }

    /// Entry point for an inbound verification code.
    pub fn deliver_challenge(&self, code: impl Into<String>) -> bool {
        self.shared.waiter.deliver(code)
    }

    /// Cancel the running flow and any queued actions, then reset to idle.
    ///
    /// Safe to call repeatedly.
    pub async fn shutdown(&self) -> RegistrationResult<()> {
        self.shared.cancel();
        self.shared
            .update_preferences(|p| p.verifying = false)
            .await?;

        info!("Registration shut down");
        Ok(())
    }
}

impl Drop for RegistrationStateMachine {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

async fn run_worker(shared: Arc<Shared>, mut queue: mpsc::UnboundedReceiver<Submission>) {
    while let Some(Submission { epoch, action }) = queue.recv().await {
        if !shared.is_current(epoch) {
            debug!(action = action.kind(), "Discarding action queued before shutdown");
            continue;
        }

        info!(
            action = action.kind(),
            phone_number = %action.number(),
            "Processing registration action"
        );
        shared.process(epoch, action).await;
    }

    debug!("Registration worker stopped");
}

/// Disarms the challenge waiter when a flow ends, however it ends.
struct DisarmOnDrop<'a>(&'a ChallengeWaiter);

impl Drop for DisarmOnDrop<'_> {
    fn drop(&mut self) {
        self.0.disarm();
    }
}

impl Shared {
    async fn process(&self, epoch: u64, action: RegistrationAction) {
        match action {
            RegistrationAction::VoiceRequested { number, password } => {
                let state = RegistrationState::with_password(
                    Phase::VoiceRequested,
                    number,
                    password.expose_secret().as_str(),
                );
                if self.transition(epoch, state).is_err() {
                    debug!("Voice request cancelled");
                }
            }
            RegistrationAction::RegisterSms {
                number,
                supports_push,
            } => {
                let attempt = RegistrationAttempt::fresh(number, supports_push);
                let result = guarded(self.register_sms(epoch, &attempt)).await;
                self.finish(epoch, &attempt, result);
            }
            RegistrationAction::VoiceRegister {
                number,
                password,
                signaling_key,
                supports_push,
            } => {
                let attempt = RegistrationAttempt {
                    number,
                    password,
                    signaling_key,
                    supports_push,
                };
                let result = guarded(self.register_voice(epoch, &attempt)).await;
                self.finish(epoch, &attempt, result);
            }
        }
    }

    #[instrument(skip(self, attempt), fields(phone_number = %attempt.number))]
    async fn register_sms(&self, epoch: u64, attempt: &RegistrationAttempt) -> RegistrationResult<()> {
        let _disarm = DisarmOnDrop(&self.waiter);

        self.mark_verifying(epoch).await?;

        let registration_id = generate_registration_id();
        self.update_attempt_preferences(epoch, move |p| p.registration_id = Some(registration_id))
            .await?;
        self.ensure_current(epoch)?;
        self.collaborators.identities.archive_all_sessions().await?;

        // Armed before the epoch check in `transition` so a concurrent
        // shutdown either sees the armed slot or fails the transition.
        self.waiter.arm();
        self.transition(epoch, RegistrationState::for_number(Phase::Connecting, &attempt.number))?;

        let account = self.collaborators.accounts.connect(attempt.credentials());
        account.request_sms_verification_code().await?;
        self.transition(epoch, RegistrationState::for_number(Phase::Verifying, &attempt.number))?;

        let challenge = self.waiter.wait(self.config.challenge_timeout).await?;
        self.ensure_current(epoch)?;
        debug!("Verifying account with received challenge");

        account
            .verify_account_with_code(
                &challenge,
                &attempt.signaling_key,
                registration_id,
                !attempt.supports_push,
            )
            .await?;

        let number = attempt.number.clone();
        self.update_attempt_preferences(epoch, move |p| p.local_number = Some(number))
            .await?;

        self.common_registration(epoch, attempt, &account).await?;
        self.mark_as_verified(epoch, attempt).await
    }

    #[instrument(skip(self, attempt), fields(phone_number = %attempt.number))]
    async fn register_voice(&self, epoch: u64, attempt: &RegistrationAttempt) -> RegistrationResult<()> {
        self.mark_verifying(epoch).await?;

        let account = self.collaborators.accounts.connect(attempt.credentials());
        self.common_registration(epoch, attempt, &account).await?;
        self.mark_as_verified(epoch, attempt).await
    }

    /// Key upload, push registration and follow-up scheduling shared by
    /// both registering flows.
    async fn common_registration(
        &self,
        epoch: u64,
        attempt: &RegistrationAttempt,
        account: &Arc<dyn AccountClient>,
    ) -> RegistrationResult<()> {
        let number = attempt.number.as_str();
        self.transition(epoch, RegistrationState::for_number(Phase::GeneratingKeys, number))?;

        if attempt.supports_push {
            self.collaborators.push.ensure_available().await?;
        }

        let bundle = self.collaborators.keys.generate_bundle().await?;
        let identity_key = bundle.identity_key_pair.public_key();
        account
            .set_pre_keys(&identity_key, &bundle.signed_pre_key, &bundle.pre_keys)
            .await?;
        debug!(pre_keys = bundle.pre_keys.len(), "Uploaded pre-keys");

        self.transition(epoch, RegistrationState::for_number(Phase::GcmRegistering, number))?;

        if attempt.supports_push {
            let token = self.collaborators.push.register().await?;
            self.ensure_current(epoch)?;
            account.set_push_token(Some(&token)).await?;
            self.update_attempt_preferences(epoch, move |p| {
                p.push_token = Some(token);
                p.push_disabled = false;
            })
            .await?;
        } else {
            self.update_attempt_preferences(epoch, |p| p.push_disabled = true)
                .await?;
        }

        self.update_attempt_preferences(epoch, |p| p.websocket_registered = true)
            .await?;
        self.ensure_current(epoch)?;
        self.collaborators
            .identities
            .save_verified_identity(number, &identity_key)
            .await?;

        self.ensure_current(epoch)?;
        self.collaborators.directory.refresh_directory(account.clone());
        self.collaborators.jobs.schedule(PeriodicJob::DirectoryRefresh);
        self.collaborators.jobs.schedule(PeriodicJob::RotateSignedPreKey);

        Ok(())
    }

    async fn mark_verifying(&self, epoch: u64) -> RegistrationResult<()> {
        self.update_attempt_preferences(epoch, |p| {
            p.verifying = true;
            p.push_registered = false;
        })
        .await
    }

    async fn mark_as_verified(
        &self,
        epoch: u64,
        attempt: &RegistrationAttempt,
    ) -> RegistrationResult<()> {
        let number = attempt.number.clone();
        let password = attempt.password.expose_secret().clone();
        let signaling_key = attempt.signaling_key.expose_secret().clone();

        self.update_attempt_preferences(epoch, move |p| {
            p.verifying = false;
            p.push_registered = true;
            p.local_number = Some(number);
            p.push_server_password = Some(password);
            p.signaling_key = Some(signaling_key);
            p.signed_pre_key_registered = true;
            p.prompted_push_registration = true;
        })
        .await
    }

    /// Publish the outcome of a flow.
    fn finish(&self, epoch: u64, attempt: &RegistrationAttempt, result: RegistrationResult<()>) {
        let number = attempt.number.as_str();

        let (state, notification) = match result {
            Ok(()) => (
                RegistrationState::for_number(Phase::Complete, number),
                RegistrationNotification::complete(),
            ),
            Err(e) => {
                let Some(phase) = e.terminal_phase() else {
                    debug!(phone_number = %number, "Registration attempt cancelled");
                    return;
                };
                warn!(phone_number = %number, ?phase, error = %e, "Registration failed");

                let state = match phase {
                    Phase::Timeout => RegistrationState::with_password(
                        phase,
                        number,
                        attempt.password.expose_secret().as_str(),
                    ),
                    _ => RegistrationState::for_number(phase, number),
                };
                (state, RegistrationNotification::failed())
            }
        };

        let phase = state.phase;
        if self.transition(epoch, state).is_err() {
            debug!(?phase, "Dropping outcome of cancelled attempt");
            return;
        }

        if phase == Phase::Complete {
            info!(phone_number = %number, "Registration complete");
        }
        if self.notifications.send(notification).is_err() {
            debug!("No notification subscribers");
        }
    }

    /// Publish `next` unless the attempt started in `epoch` was cancelled.
    ///
    /// The epoch check and the publication happen under the state lock, so
    /// they are atomic with respect to [`Shared::cancel`].
    fn transition(&self, epoch: u64, next: RegistrationState) -> Result<(), ChallengeError> {
        let phase = next.phase;
        let published = self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            *state = next;
            self.notify_observer(state);
            true
        });

        if published {
            debug!(?phase, "State transition");
            Ok(())
        } else {
            Err(ChallengeError::Cancelled)
        }
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), ChallengeError> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(ChallengeError::Cancelled)
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Invalidate the running and queued attempts and force the idle state.
    fn cancel(&self) {
        self.state.send_modify(|state| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *state = RegistrationState::idle();
            self.notify_observer(state);
        });
        // After the epoch bump: a flow arming from here on fails its next
        // transition instead of waiting.
        self.waiter.disarm();
    }

    fn notify_observer(&self, state: &RegistrationState) {
        let mut observer = self.observer.lock();
        if let Some(sender) = observer.as_ref() {
            if sender.send(state.clone()).is_err() {
                debug!("State observer closed, detaching");
                *observer = None;
            }
        }
    }

    /// Apply `apply` only while the attempt started in `epoch` is current.
    ///
    /// The epoch is read inside the store's serialized update. An update
    /// either lands before [`Shared::cancel`] bumps the epoch, and so before
    /// the reset that `shutdown` writes afterwards, or not at all.
    async fn update_attempt_preferences<F>(&self, epoch: u64, apply: F) -> RegistrationResult<()>
    where
        F: FnOnce(&mut Preferences) + Send + 'static,
    {
        let current = self.epoch.clone();
        let applied = Arc::new(AtomicBool::new(false));
        let flag = applied.clone();

        self.update_preferences(move |p| {
            if current.load(Ordering::SeqCst) == epoch {
                apply(p);
                flag.store(true, Ordering::SeqCst);
            }
        })
        .await?;

        if applied.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChallengeError::Cancelled.into())
        }
    }

    async fn update_preferences<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Preferences) + Send + 'static,
    {
        self.collaborators
            .preferences
            .update_preferences(Box::new(apply))
            .await
    }
}

/// Run a flow, turning a panic into a failed attempt so the worker survives.
async fn guarded<F>(flow: F) -> RegistrationResult<()>
where
    F: std::future::Future<Output = RegistrationResult<()>>,
{
    match AssertUnwindSafe(flow).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Registration flow panicked");
            Err(RegistrationError::Internal(message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
