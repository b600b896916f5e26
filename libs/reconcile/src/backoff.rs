//! Exponential backoff with jitter and a finite retry budget.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Growth factor applied per attempt.
    pub multiplier: f64,

    /// Maximum delay between two attempts.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0). A delay `d` is drawn from `d * (1 ± jitter)`.
    pub jitter: f64,

    /// Total delay budget. Once the delays handed out reach it, the schedule ends.
    pub max_elapsed: Duration,

    /// Hard cap on the number of retries, independent of delay sizes.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 1.5,
            max: Duration::from_secs(60),
            jitter: 0.5,
            max_elapsed: Duration::from_secs(15 * 60),
            max_retries: 500,
        }
    }
}

impl BackoffPolicy {
    /// A policy with no jitter, useful where delays must be predictable.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Un-jittered delay for the given attempt, capped at `max`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let capped = secs.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay for the given attempt with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }

        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(nominal.as_secs_f64() * factor)
    }

    /// Start a fresh retry schedule.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// A running retry schedule produced by [`BackoffPolicy::start`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    elapsed: Duration,
}

impl Backoff {
    /// The next delay to wait, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries || self.elapsed >= self.policy.max_elapsed {
            return None;
        }

        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        self.elapsed = self.elapsed.saturating_add(delay);
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Sum of the delays handed out so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
