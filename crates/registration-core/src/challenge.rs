//! Single-slot handoff for an externally delivered verification code.
//!
//! The registration worker arms the slot before requesting a code and then
//! waits on it. Whatever observes the inbound SMS or push event calls
//! [`ChallengeWaiter::deliver`]. A code delivered between `arm` and `wait`
//! is buffered in the slot and returned as soon as `wait` is called.

use crate::error::ChallengeError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Slot {
    /// Accepting deliveries
    armed: bool,
    /// Set by `disarm`; any wait returns `Cancelled` until the next `arm`
    cancelled: bool,
    challenge: Option<String>,
    /// Start and length of the wait in progress
    wait: Option<(Instant, Duration)>,
}

/// Rendezvous between the registration worker and the challenge source.
#[derive(Debug, Default)]
pub struct ChallengeWaiter {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl ChallengeWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear any previous challenge and start accepting deliveries.
    pub fn arm(&self) {
        let mut slot = self.slot.lock();
        *slot = Slot {
            armed: true,
            ..Slot::default()
        };
        debug!("Challenge listener armed");
    }

    /// Stop accepting deliveries and fail any wait in progress as cancelled.
    pub fn disarm(&self) {
        let mut slot = self.slot.lock();
        let was_waiting = slot.wait.take().is_some();
        slot.armed = false;
        slot.cancelled = true;
        slot.challenge = None;
        drop(slot);

        if was_waiting {
            debug!("Cancelling challenge wait in progress");
        }
        self.notify.notify_one();
    }

    /// Hand a received challenge to the worker.
    ///
    /// Returns `false` when nothing is armed and the code was dropped.
    pub fn deliver(&self, code: impl Into<String>) -> bool {
        let mut slot = self.slot.lock();
        if !slot.armed {
            warn!("Dropping challenge, no registration is waiting for one");
            return false;
        }
        slot.challenge = Some(code.into());
        drop(slot);

        debug!("Challenge received");
        self.notify.notify_one();
        true
    }

    /// Wait until a challenge is delivered, the timeout elapses, or the
    /// waiter is disarmed.
    pub async fn wait(&self, timeout: Duration) -> Result<String, ChallengeError> {
        let started = Instant::now();
        let deadline = started + timeout;
        self.slot.lock().wait = Some((started, timeout));

        let outcome = loop {
            if let Some(outcome) = self.take_outcome() {
                break outcome;
            }
            // A delivery racing this check leaves a permit on `notify`, so the
            // next `notified()` resolves immediately.
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                break self
                    .take_outcome()
                    .unwrap_or(Err(ChallengeError::Timeout));
            }
        };

        self.slot.lock().wait = None;
        outcome
    }

    fn take_outcome(&self) -> Option<Result<String, ChallengeError>> {
        let mut slot = self.slot.lock();
        if slot.cancelled {
            return Some(Err(ChallengeError::Cancelled));
        }
        slot.challenge.take().map(Ok)
    }

    /// Whole seconds left in the wait in progress, `0` when not waiting.
    pub fn seconds_remaining(&self) -> u64 {
        let slot = self.slot.lock();
        match slot.wait {
            Some((started, timeout)) if !slot.cancelled => {
                timeout.saturating_sub(started.elapsed()).as_secs()
            }
            _ => 0,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    const TIMEOUT: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn test_deliver_before_wait_returns_immediately() {
        let waiter = ChallengeWaiter::new();
        waiter.arm();
        assert!(waiter.deliver("123456"));

        let mut wait = tokio_test::task::spawn(waiter.wait(TIMEOUT));
        let code = assert_ready!(wait.poll());
        assert_eq!(code, Ok("123456".to_string()));
    }

    #[tokio::test]
    async fn test_deliver_wakes_pending_wait() {
        let waiter = ChallengeWaiter::new();
        waiter.arm();

        let mut wait = tokio_test::task::spawn(waiter.wait(TIMEOUT));
        assert_pending!(wait.poll());

        assert!(waiter.deliver("654321"));
        assert!(wait.is_woken());
        assert_eq!(assert_ready!(wait.poll()), Ok("654321".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let waiter = ChallengeWaiter::new();
        waiter.arm();

        let result = waiter.wait(TIMEOUT).await;
        assert_eq!(result, Err(ChallengeError::Timeout));
        assert_eq!(waiter.seconds_remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_wait_in_progress() {
        let waiter = Arc::new(ChallengeWaiter::new());
        waiter.arm();

        let task = {
            let waiter = waiter.clone();
            tokio::spawn(async move { waiter.wait(TIMEOUT).await })
        };
        tokio::task::yield_now().await;

        waiter.disarm();
        let result = task.await.unwrap();
        assert_eq!(result, Err(ChallengeError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_stops_countdown_before_wait_resumes() {
        let waiter = ChallengeWaiter::new();
        waiter.arm();

        let mut wait = tokio_test::task::spawn(waiter.wait(TIMEOUT));
        assert_pending!(wait.poll());
        assert_eq!(waiter.seconds_remaining(), 120);

        waiter.disarm();
        assert_eq!(waiter.seconds_remaining(), 0);
        assert_eq!(assert_ready!(wait.poll()), Err(ChallengeError::Cancelled));
        assert_eq!(waiter.seconds_remaining(), 0);
    }

    #[tokio::test]
    async fn test_wait_after_disarm_is_cancelled() {
        let waiter = ChallengeWaiter::new();
        waiter.arm();
        waiter.disarm();

        let mut wait = tokio_test::task::spawn(waiter.wait(TIMEOUT));
        assert_eq!(assert_ready!(wait.poll()), Err(ChallengeError::Cancelled));
    }

    #[test]
    fn test_deliver_when_disarmed_is_dropped() {
        let waiter = ChallengeWaiter::new();
        assert!(!waiter.deliver("123456"));

        waiter.arm();
        waiter.disarm();
        assert!(!waiter.deliver("123456"));
        assert!(!waiter.is_armed());
    }

    #[tokio::test]
    async fn test_arm_clears_previous_challenge() {
        let waiter = ChallengeWaiter::new();
        waiter.arm();
        waiter.deliver("111111");
        waiter.arm();

        let mut wait = tokio_test::task::spawn(waiter.wait(TIMEOUT));
        assert_pending!(wait.poll());

        waiter.deliver("222222");
        assert_eq!(assert_ready!(wait.poll()), Ok("222222".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seconds_remaining_counts_down() {
        let waiter = Arc::new(ChallengeWaiter::new());
        waiter.arm();
        assert_eq!(waiter.seconds_remaining(), 0);

        let task = {
            let waiter = waiter.clone();
            tokio::spawn(async move { waiter.wait(TIMEOUT).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(waiter.seconds_remaining(), 120);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(waiter.seconds_remaining(), 90);

        tokio::time::advance(Duration::from_millis(89_500)).await;
        assert_eq!(waiter.seconds_remaining(), 0);

        let result = task.await.unwrap();
        assert_eq!(result, Err(ChallengeError::Timeout));
        assert_eq!(waiter.seconds_remaining(), 0);
    }
}
