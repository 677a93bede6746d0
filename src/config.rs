//! Engine-wide configuration.

use std::time::{Duration, Instant};

/// Retry schedule for calls into external collaborators.
///
/// Callers never sleep: a failed call records itself in a [`Backoff`] and the
/// next attempt is made by a later tick once the delay has passed.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Consecutive failures after which the collaborator is reported as
    /// unavailable. Zero is treated as one.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that reports the first failure and retries on the next tick.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Consecutive-failure state for one collaborator.
#[derive(Clone, Debug, Default)]
pub struct Backoff {
    failures: u32,
    retry_after: Option<Instant>,
}

impl Backoff {
    /// Whether another attempt may be made at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.retry_after.map_or(true, |at| now >= at)
    }

    /// Record a failed attempt and schedule the next one.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now: Instant) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.retry_after = Some(now + policy.backoff_for(self.failures));
        self.failures
    }

    /// Forget previous failures. Returns how many there were.
    pub fn reset(&mut self) -> u32 {
        self.retry_after = None;
        std::mem::take(&mut self.failures)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the policy's attempts are used up.
    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        self.failures >= policy.attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Interval of the per-subscription dispatch loop.
    /// None = no worker threads; the owner calls `tick` itself.
    pub tick_interval: Option<Duration>,

    /// Window over which per-connection throughput is measured.
    pub measurement_window: Duration,

    /// Drain grace period as a multiple of the message timeout.
    pub drain_grace_multiplier: u32,

    /// Lower bound for the drain grace period (used when timeouts are off).
    pub min_drain_grace: Duration,

    /// Backoff for log reads.
    pub read_retry: RetryPolicy,

    /// Backoff for checkpoint loads and writes.
    pub checkpoint_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Some(Duration::from_millis(100)),
            measurement_window: Duration::from_secs(1),
            drain_grace_multiplier: 4,
            min_drain_grace: Duration::from_secs(30),
            read_retry: RetryPolicy::default(),
            checkpoint_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for callers that drive ticks by hand (tests, embedding).
    pub fn manual() -> Self {
        Self {
            tick_interval: None,
            read_retry: RetryPolicy::none(),
            checkpoint_retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    /// Grace period allowed for draining a deleted subscription.
    pub fn drain_grace(&self, message_timeout: Option<Duration>) -> Duration {
        match message_timeout {
            Some(timeout) => timeout
                .saturating_mul(self.drain_grace_multiplier.max(1))
                .max(timeout),
            None => self.min_drain_grace,
        }
    }
}
