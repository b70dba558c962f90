//! Lifecycle management.
//!
//! Ingestion shuts down in two phases. First, intake stops: no new messages are received and no new admissions are
//! granted. Then, the delivery side keeps resolving outstanding submissions until none remain or the grace period
//! elapses, after which it stops too and anything still outstanding is abandoned.

use std::{future::Future, time::Duration};

use tokio::time::timeout;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, Instrument as _};

/// Result of a graceful shutdown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShutdownReport {
    /// Whether every outstanding submission was resolved, leaving nothing to abandon.
    pub drained: bool,

    /// Number of outstanding submissions abandoned once the grace period elapsed.
    pub abandoned: usize,
}

/// Owns the cancellation signals and tasks of an ingester.
///
/// Tasks are spawned either on the intake side (stopped first) or the drain side (stopped once outstanding work is
/// resolved). Cancelling the drain side always cancels the intake side too.
pub struct Lifecycle {
    drain: CancellationToken,
    intake: CancellationToken,
    intake_tasks: TaskTracker,
    drain_tasks: TaskTracker,
    grace_period: Duration,
}

impl Lifecycle {
    /// Creates a new `Lifecycle` with the given drain grace period.
    pub fn new(grace_period: Duration) -> Self {
        let drain = CancellationToken::new();
        let intake = drain.child_token();
        Self {
            drain,
            intake,
            intake_tasks: TaskTracker::new(),
            drain_tasks: TaskTracker::new(),
            grace_period,
        }
    }

    /// Returns the token cancelled when intake stops.
    pub fn intake_token(&self) -> CancellationToken {
        self.intake.clone()
    }

    /// Returns the token cancelled when draining stops.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.intake.is_cancelled()
    }

    /// Returns the drain grace period.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Spawns an intake-side task.
    pub fn spawn_intake<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.intake_tasks.spawn(f.in_current_span());
    }

    /// Spawns a drain-side task.
    pub fn spawn_drain<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.drain_tasks.spawn(f.in_current_span());
    }

    /// Shuts down gracefully.
    ///
    /// Stops intake and waits for intake tasks to exit, then waits up to the grace period for `drained` to complete,
    /// and finally stops the drain side and waits for its tasks to exit.
    ///
    /// Returns `true` if `drained` completed within the grace period.
    pub async fn shutdown<F>(&self, drained: F) -> bool
    where
        F: Future<Output = ()>,
    {
        debug!("Stopping intake.");
        self.intake.cancel();
        self.intake_tasks.close();
        self.intake_tasks.wait().await;

        debug!(grace_period = ?self.grace_period, "Intake stopped. Draining outstanding submissions.");
        let drained = timeout(self.grace_period, drained).await.is_ok();

        self.drain.cancel();
        self.drain_tasks.close();
        self.drain_tasks.wait().await;
        debug!(drained, "Drain stopped.");

        drained
    }
}
