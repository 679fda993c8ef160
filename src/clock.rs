//! Time source and bounded waits
//!
//! Every polling loop in the engine runs against a monotonic deadline
//! rather than an iteration count. The [`Clock`] seam lets tests swap in a
//! [`ManualClock`] whose `sleep` advances time instantly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ClusterResult;

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `std::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Fake clock: `sleep` advances the clock and returns immediately.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed_nanos: AtomicU64,
    sleeps: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_nanos: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
        }
    }

    /// Advance time without counting a sleep.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Total simulated time since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }

    /// Number of `sleep` calls observed.
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.advance(duration);
    }
}

/// A point in time after which a wait gives up.
pub struct Deadline {
    clock: Arc<dyn Clock>,
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let at = clock.now() + timeout;
        Self { clock, at }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.clock.now() >= self.at
    }

    /// Time left before the deadline (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(self.clock.now())
    }

    /// Sleep for `interval`, clipped to the remaining time.
    pub fn sleep(&self, interval: Duration) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            self.clock.sleep(interval.min(remaining));
        }
    }
}

/// Outcome of a [`poll_until`] loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The condition produced a value after `polls` evaluations.
    Ready { value: T, polls: u32 },
    /// The deadline passed after `polls` evaluations.
    TimedOut { polls: u32 },
}

impl<T> PollOutcome<T> {
    /// Number of times the condition was evaluated.
    pub fn polls(&self) -> u32 {
        match self {
            PollOutcome::Ready { polls, .. } | PollOutcome::TimedOut { polls } => *polls,
        }
    }

    /// The value, if the condition was met.
    pub fn into_value(self) -> Option<T> {
        match self {
            PollOutcome::Ready { value, .. } => Some(value),
            PollOutcome::TimedOut { .. } => None,
        }
    }
}

/// Evaluate `check` immediately and then once per `interval` until it
/// returns `Some`, an error, or `timeout` elapses.
///
/// The condition is always evaluated at least once, and once more after the
/// final sleep, so a condition that becomes true exactly at the deadline is
/// still observed.
pub fn poll_until<T, F>(
    clock: &Arc<dyn Clock>,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> ClusterResult<PollOutcome<T>>
where
    F: FnMut(u32) -> ClusterResult<Option<T>>,
{
    let deadline = Deadline::after(Arc::clone(clock), timeout);
    let mut polls = 0u32;
    loop {
        polls += 1;
        if let Some(value) = check(polls)? {
            return Ok(PollOutcome::Ready { value, polls });
        }
        if deadline.expired() {
            return Ok(PollOutcome::TimedOut { polls });
        }
        deadline.sleep(interval);
    }
}

/// Bounded retry policy: `attempts` tries, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Run `op` until it succeeds or the attempts are exhausted; the last
    /// error is returned. Non-transient errors are returned immediately.
    pub fn run<T, F>(&self, clock: &dyn Clock, mut op: F) -> ClusterResult<T>
    where
        F: FnMut(u32) -> ClusterResult<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    clock.sleep(self.interval);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;

    fn manual() -> (Arc<ManualClock>, Arc<dyn Clock>) {
        let clock = Arc::new(ManualClock::new());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        (clock, dyn_clock)
    }

    #[test]
    fn test_poll_until_ready_first_time_never_sleeps() {
        let (clock, dyn_clock) = manual();
        let outcome = poll_until(&dyn_clock, Duration::from_secs(10), Duration::from_secs(1), |_| {
            Ok(Some(7))
        })
        .unwrap();
        assert_eq!(outcome, PollOutcome::Ready { value: 7, polls: 1 });
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_poll_until_times_out_on_deadline() {
        let (clock, dyn_clock) = manual();
        let outcome: PollOutcome<()> =
            poll_until(&dyn_clock, Duration::from_secs(5), Duration::from_secs(2), |_| Ok(None))
                .unwrap();
        // evaluations at t=0, 2, 4, 5
        assert_eq!(outcome, PollOutcome::TimedOut { polls: 4 });
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_poll_until_propagates_errors() {
        let (_, dyn_clock) = manual();
        let result: ClusterResult<PollOutcome<()>> =
            poll_until(&dyn_clock, Duration::from_secs(5), Duration::from_secs(1), |_| {
                Err(ClusterError::fatal("boom"))
            });
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_policy_stops_after_attempts() {
        let clock = ManualClock::new();
        let policy = RetryPolicy {
            attempts: 3,
            interval: Duration::from_secs(10),
        };
        let mut calls = 0;
        let result: ClusterResult<()> = policy.run(&clock, |_| {
            calls += 1;
            Err(ClusterError::unreachable("host=a", "refused"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
        assert_eq!(clock.sleep_count(), 2);
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn test_retry_policy_does_not_retry_fatal() {
        let clock = ManualClock::new();
        let policy = RetryPolicy {
            attempts: 5,
            interval: Duration::from_secs(1),
        };
        let mut calls = 0;
        let _: ClusterResult<()> = policy.run(&clock, |_| {
            calls += 1;
            Err(ClusterError::fatal("no"))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_policy_recovers() {
        let clock = ManualClock::new();
        let policy = RetryPolicy {
            attempts: 4,
            interval: Duration::from_secs(1),
        };
        let value = policy
            .run(&clock, |attempt| {
                if attempt < 3 {
                    Err(ClusterError::unreachable("host=a", "refused"))
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
    }
}
