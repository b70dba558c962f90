//! Admission control.

use std::{sync::Arc, time::Duration};

use snafu::Snafu;
use tokio::{
    select,
    sync::{watch, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;

/// Admission was not granted.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum AdmissionError {
    /// Cancellation was signalled while waiting for a slot.
    #[snafu(display("Cancelled while waiting for an admission slot."))]
    Cancelled,

    /// No slot became available before the deadline.
    #[snafu(display("No admission slot became available within {:?}.", timeout))]
    TimedOut {
        /// How long the caller waited.
        timeout: Duration,
    },
}

/// A fixed-size pool of admission slots.
///
/// Each slot represents one metric group that has been admitted for delivery but not yet resolved. The controller is
/// cheaply cloneable, and all clones share the same pool.
///
/// A slot stays held for as long as its group is outstanding, including while a failed group is being resubmitted, so
/// the pool becoming idle is the point at which nothing is left to resolve.
#[derive(Clone, Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    held_tx: Arc<watch::Sender<usize>>,
    capacity: usize,
}

impl AdmissionController {
    /// Creates a new `AdmissionController` with the given number of slots.
    pub fn new(capacity: usize) -> Self {
        let (held_tx, _) = watch::channel(0);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            held_tx: Arc::new(held_tx),
            capacity,
        }
    }

    /// Returns the total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of slots currently held.
    pub fn in_flight(&self) -> usize {
        *self.held_tx.borrow()
    }

    /// Waits until no slots are held.
    pub async fn wait_until_idle(&self) {
        let mut held_rx = self.held_tx.subscribe();
        // The controller keeps the sender alive, so this cannot fail while we hold `self`.
        let _ = held_rx.wait_for(|held| *held == 0).await;
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        self.held_tx.send_modify(|held| *held += 1);
        AdmissionPermit {
            _permit: permit,
            held_tx: Arc::clone(&self.held_tx),
        }
    }

    /// Waits for a slot to become available.
    ///
    /// Returns `None` if `cancel` fires first, in which case no slot is held and nothing must be released.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<AdmissionPermit> {
        select! {
            biased;

            _ = cancel.cancelled() => None,
            result = Arc::clone(&self.semaphore).acquire_owned() => result.ok().map(|permit| self.admit(permit)),
        }
    }

    /// Waits for a slot to become available, for at most `timeout`.
    ///
    /// # Errors
    ///
    /// If `cancel` fires, or the deadline passes, before a slot becomes available, an error is returned.
    pub async fn acquire_timeout(
        &self, cancel: &CancellationToken, timeout: Duration,
    ) -> Result<AdmissionPermit, AdmissionError> {
        match tokio::time::timeout(timeout, self.acquire(cancel)).await {
            Ok(Some(permit)) => Ok(permit),
            Ok(None) => Err(AdmissionError::Cancelled),
            Err(_) => Err(AdmissionError::TimedOut { timeout }),
        }
    }

    /// Acquires a slot if one is immediately available.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }
}

/// A held admission slot.
///
/// The slot is released when the permit is dropped. Permits cannot be cloned, so a slot is released exactly once.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    held_tx: Arc<watch::Sender<usize>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.held_tx.send_modify(|held| *held = held.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task::spawn};

    use super::*;

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let admission = AdmissionController::new(1);
        let cancel = CancellationToken::new();

        let held = admission.acquire(&cancel).await.expect("slot should be free");
        assert_eq!(admission.in_flight(), 1);

        let mut waiting = spawn(admission.acquire(&cancel));
        assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        let permit = assert_ready!(waiting.poll());
        assert!(permit.is_some());
        assert_eq!(admission.in_flight(), 1);
    }

    #[tokio::test]
    async fn cancelled_acquire_holds_nothing() {
        let admission = AdmissionController::new(1);
        let cancel = CancellationToken::new();

        let _held = admission.try_acquire().expect("slot should be free");

        let mut waiting = spawn(admission.acquire(&cancel));
        assert_pending!(waiting.poll());

        cancel.cancel();
        assert!(assert_ready!(waiting.poll()).is_none());
        assert_eq!(admission.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_expires() {
        let admission = AdmissionController::new(1);
        let cancel = CancellationToken::new();

        let _held = admission.try_acquire().expect("slot should be free");
        let timeout = Duration::from_millis(250);

        assert_eq!(
            admission.acquire_timeout(&cancel, timeout).await.unwrap_err(),
            AdmissionError::TimedOut { timeout }
        );
    }

    #[test]
    fn try_acquire_respects_capacity() {
        let admission = AdmissionController::new(2);

        let first = admission.try_acquire();
        let second = admission.try_acquire();
        assert!(first.is_some() && second.is_some());
        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.in_flight(), 2);

        drop(first);
        assert_eq!(admission.in_flight(), 1);
        assert_eq!(admission.capacity(), 2);
    }

    #[tokio::test]
    async fn wait_until_idle_tracks_held_slots() {
        let admission = AdmissionController::new(2);

        let first = admission.try_acquire().expect("slot should be free");
        let second = admission.try_acquire().expect("slot should be free");

        let mut idle = spawn(admission.wait_until_idle());
        assert_pending!(idle.poll());

        drop(first);
        assert_pending!(idle.poll());

        drop(second);
        assert!(idle.is_woken());
        assert_ready!(idle.poll());
        assert_eq!(admission.in_flight(), 0);
    }
}
