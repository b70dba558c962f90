//! Retry backoff for source-level failures.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
use tokio_util::sync::CancellationToken;

/// Default minimum backoff when a source fails to receive.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Default maximum backoff when a source fails to receive.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default jitter factor.
pub const DEFAULT_JITTER_FACTOR: f64 = 2.0;

#[derive(Clone, Debug)]
enum JitterRng {
    Thread,
    Seeded(Arc<Mutex<StdRng>>),
}

impl JitterRng {
    fn sample(&self, lower: Duration, upper: Duration) -> Duration {
        match self {
            Self::Thread => rand::rng().random_range(lower..=upper),
            Self::Seeded(rng) => rng.lock().unwrap().random_range(lower..=upper),
        }
    }
}

/// An exponential backoff strategy.
///
/// Durations double with each consecutive error, starting from the minimum and capped at the maximum. With a jitter
/// factor above 1.0, each duration `D` is instead drawn uniformly from `D/factor..=D`, so that many sources failing at
/// once don't retry in lockstep.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    jitter_factor: f64,
    rng: JitterRng,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` without jitter.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self::with_jitter(min_backoff, max_backoff, 1.0)
    }

    /// Creates a new `ExponentialBackoff` with the given jitter factor.
    ///
    /// A factor of 1.0 or less disables jitter.
    pub fn with_jitter(min_backoff: Duration, max_backoff: Duration, jitter_factor: f64) -> Self {
        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            jitter_factor: jitter_factor.max(1.0),
            rng: JitterRng::Thread,
        }
    }

    /// Uses a deterministic random number generator seeded with `seed` for jitter.
    ///
    /// Intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = JitterRng::Seeded(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))));
        self
    }

    /// Returns the backoff duration after `error_count` consecutive errors.
    pub fn get_backoff_duration(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return self.min_backoff;
        }

        let mut backoff = self.min_backoff.saturating_mul(2u32.saturating_pow(error_count));
        if self.jitter_factor > 1.0 {
            backoff = self.rng.sample(backoff.div_f64(self.jitter_factor), backoff);
        }

        backoff.clamp(self.min_backoff, self.max_backoff)
    }

    /// Sleeps for the backoff duration after `error_count` consecutive errors.
    ///
    /// Returns `false` if `cancel` fired before the sleep completed.
    pub async fn wait(&self, error_count: u32, cancel: &CancellationToken) -> bool {
        let duration = self.get_backoff_duration(error_count);
        tokio::select! {
            biased;

            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::with_jitter(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_JITTER_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_backoff(jitter_factor: f64) -> impl Strategy<Value = ExponentialBackoff> {
        (1u64..=1_000_000_000, 0u64..=1_000_000_000_000, any::<u64>()).prop_map(move |(min, extra, seed)| {
            ExponentialBackoff::with_jitter(
                Duration::from_nanos(min),
                Duration::from_nanos(min.saturating_add(extra)),
                jitter_factor,
            )
            .with_seed(seed)
        })
    }

    #[test]
    fn doubles_until_capped() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(backoff.get_backoff_duration(0), Duration::from_millis(100));
        assert_eq!(backoff.get_backoff_duration(1), Duration::from_millis(200));
        assert_eq!(backoff.get_backoff_duration(3), Duration::from_millis(800));
        assert_eq!(backoff.get_backoff_duration(4), Duration::from_secs(1));
        assert_eq!(backoff.get_backoff_duration(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_cancellation() {
        let backoff = ExponentialBackoff::default();
        let cancel = CancellationToken::new();

        assert!(backoff.wait(0, &cancel).await);

        cancel.cancel();
        assert!(!backoff.wait(10, &cancel).await);
    }

    proptest! {
        #[test]
        fn property_test_no_jitter_is_monotonic(
            backoff in arb_backoff(1.0),
            error_count in 0..u32::MAX,
            increase in 1..5u32,
        ) {
            let first = backoff.get_backoff_duration(error_count);
            let second = backoff.get_backoff_duration(error_count.saturating_add(increase));

            prop_assert_eq!(first, backoff.get_backoff_duration(error_count));
            prop_assert!(first <= second);
            prop_assert!(first >= backoff.min_backoff && second <= backoff.max_backoff);
        }

        #[test]
        fn property_test_jitter_stays_in_bounds(
            backoff in arb_backoff(DEFAULT_JITTER_FACTOR),
            error_count in 0..u32::MAX,
        ) {
            let duration = backoff.get_backoff_duration(error_count);

            prop_assert!(duration >= backoff.min_backoff);
            prop_assert!(duration <= backoff.max_backoff);
        }
    }
}
