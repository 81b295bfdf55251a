//! Bounded exponential-backoff retry
//!
//! [`RetryExecutor`] runs a fallible operation until it succeeds, the
//! deadline passes, or the cancellation token fires. The token is checked
//! before every attempt and raced against every sleep, so cancellation never
//! interrupts an attempt in flight but stops the next one.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pw_core::config::BackoffConfig;

/// Shortest delay between two attempts
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Stand-in for a budget too large to represent as an instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `budget` from now, saturating far in the future
pub fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Parameters of an exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Cap on a single delay
    pub max_interval: Duration,
    /// Total time budget, measured from the first attempt
    pub max_elapsed: Duration,
    /// Jitter factor (0.0 to 1.0) added on top of each delay
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Create a policy without jitter
    pub fn new(
        initial: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_elapsed: Duration,
    ) -> Self {
        Self {
            initial,
            multiplier,
            max_interval,
            max_elapsed,
            jitter: 0.0,
        }
    }

    /// Create a policy from configuration with the given time budget
    pub fn from_config(config: &BackoffConfig, max_elapsed: Duration) -> Self {
        Self {
            initial: config.initial.max(MIN_DELAY),
            multiplier: config.multiplier,
            max_interval: config.max,
            max_elapsed,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Same policy with a different time budget
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
            jitter: 0.5,
        }
    }
}

/// Exponential backoff with jitter
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from a policy
    ///
    /// Delays never drop below [`MIN_DELAY`]. A NaN multiplier or jitter
    /// is treated as no growth or no jitter.
    pub fn from_policy(policy: &BackoffPolicy) -> Self {
        let max = policy.max_interval.max(MIN_DELAY);
        Self {
            current: policy.initial.clamp(MIN_DELAY, max),
            max,
            multiplier: policy.multiplier.max(1.0),
            jitter: if policy.jitter.is_finite() {
                policy.jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Products past what a Duration holds saturate at the cap
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);

        if self.jitter > 0.0 {
            let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
            delay.saturating_add(Duration::try_from_secs_f64(jitter_amount).unwrap_or(Duration::MAX))
        } else {
            delay
        }
    }
}

/// How a retried operation ended
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded
    Succeeded(T),
    /// The token fired before success; not a failure
    Cancelled,
    /// The time budget ran out; carries the last error seen
    Exhausted { error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    /// Whether the retry loop stopped because of cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The success value, if any
    pub fn succeeded(self) -> Option<T> {
        match self {
            Self::Succeeded(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs fallible operations under a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
}

impl RetryExecutor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Retry within the policy's own time budget
    pub async fn run<T, E, F, Fut, N>(
        &self,
        cancel: &CancellationToken,
        operation: F,
        on_retry: N,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: FnMut(&E, Duration),
    {
        let deadline = deadline_after(self.policy.max_elapsed);
        self.run_until(deadline, cancel, operation, on_retry).await
    }

    /// Retry until `deadline` or the policy's budget, whichever is sooner
    ///
    /// `on_retry` is called with each failure and the delay before the next
    /// attempt. It is purely for observation.
    pub async fn run_until<T, E, F, Fut, N>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_retry: N,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: FnMut(&E, Duration),
    {
        let deadline = deadline.min(deadline_after(self.policy.max_elapsed));
        let mut backoff = ExponentialBackoff::from_policy(&self.policy);
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled;
            }

            attempts += 1;
            let error = match operation().await {
                Ok(value) => return RetryOutcome::Succeeded(value),
                Err(error) => error,
            };

            if Instant::now() >= deadline {
                return RetryOutcome::Exhausted { error, attempts };
            }

            let delay = backoff.next_delay();
            on_retry(&error, delay);

            tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
