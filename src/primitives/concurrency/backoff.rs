use std::fmt;
use std::thread;
use std::time::Duration;

use rand::Rng;

/// Delays below this are served by yielding instead of sleeping.
const YIELD_THRESHOLD: Duration = Duration::from_micros(50);

/// Pacing between attempts of a transaction that hit a conflict.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Returns the delay to apply before attempt `attempt + 1`.
    fn delay_for(&self, attempt: u32) -> Duration;

    /// Sleeps (or yields) for [`delay_for`](Self::delay_for).
    fn delay(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if delay.is_zero() {
            return;
        }
        if delay < YIELD_THRESHOLD {
            thread::yield_now();
        } else {
            thread::sleep(delay);
        }
    }
}

/// Exponential backoff with full jitter.
///
/// The ceiling doubles per attempt starting at `min_delay` and is capped at
/// `max_delay`; the actual delay is drawn uniformly from `[0, ceiling]` so
/// colliding transactions spread out.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffPolicy {
    min_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    /// Creates a policy; `max_delay` is raised to `min_delay` when smaller.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// Upper bound for the delay of `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.min(30);
        let nanos = (self.min_delay.as_nanos() as u64).saturating_mul(1u64 << shift);
        Duration::from_nanos(nanos).min(self.max_delay)
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_nanos(100), Duration::from_millis(10))
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_nanos() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Retries immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBackoffPolicy;

impl BackoffPolicy for NoBackoffPolicy {
    fn delay_for(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}
