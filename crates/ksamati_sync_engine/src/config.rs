//! Coordinator tuning: page sizes, call timeout and cycle backoff.

use rand::Rng;
use std::time::Duration;

/// Tuning for one device's sync cycles.
///
/// Page sizes of zero are treated as one, so a cycle always makes progress.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Changes requested from the central store per pull page.
    pub pull_batch_size: u32,
    /// Queue entries submitted per push request.
    pub push_batch_size: u32,
    /// Deadline for a single pull or push call.
    pub timeout: Duration,
    /// Backoff between failed cycles in `sync_with_retry`.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Pages of 100 in both directions and a 30 second call deadline.
    pub fn new() -> Self {
        Self {
            pull_batch_size: 100,
            push_batch_size: 100,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Changes per pull page; zero becomes one.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Entries per push request; zero becomes one.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Replaces the cycle backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pull page size actually sent to the central store.
    pub fn pull_limit(&self) -> u32 {
        self.pull_batch_size.max(1)
    }

    /// Number of queue entries taken per push request.
    pub fn push_limit(&self) -> usize {
        self.push_batch_size.max(1) as usize
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How long `sync_with_retry` waits before re-running a failed cycle.
///
/// Only errors that report themselves retryable are retried. The wait
/// doubles by default and is capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Cycles attempted in total. One means a failed cycle is final.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any wait, before jitter.
    pub max_delay: Duration,
    /// Growth factor applied per further attempt.
    pub backoff_multiplier: f64,
    /// Adds up to a quarter of the wait on top.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// `max_attempts` cycles, starting at 100ms and doubling up to 30s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt. Failures surface immediately.
    pub fn no_retry() -> Self {
        Self {
            max_delay: Duration::ZERO,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
            ..Self::new(1)
        }
    }

    /// Wait before the second attempt.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Cap on the grown wait.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor per attempt.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Turns the random spread on or off.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Wait before cycle number `attempt`, counted from zero.
    ///
    /// The first cycle runs immediately. Cycle `n` waits
    /// `initial_delay * backoff_multiplier^(n - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retries) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = grown.min(self.max_delay.as_secs_f64());

        let spread = if self.add_jitter && capped > 0.0 {
            rand::thread_rng().gen_range(0.0..capped / 4.0)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + spread)
    }
}

impl Default for RetryConfig {
    /// Three cycles in total.
    fn default() -> Self {
        Self::new(3)
    }
}
