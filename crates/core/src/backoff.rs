//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Base delay of the exponential strategy when the job sets no `retry_delay`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Upper bound on any computed exponential delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(3_600_000);

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^(attempt-1) * jitter`, capped
    #[default]
    Exponential,
    /// Constant `retry_delay` between retries
    Fixed,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Fixed => "fixed",
        }
    }

    /// Delay before the next attempt, given the attempt that just failed.
    ///
    /// `retry_delay` is the constant delay for `Fixed` and the base delay for
    /// `Exponential` (falling back to [`DEFAULT_BASE_DELAY`]).
    pub fn delay_for(&self, attempt: u32, retry_delay: Option<Duration>) -> Duration {
        match self {
            BackoffStrategy::Fixed => retry_delay.unwrap_or(DEFAULT_BASE_DELAY),
            BackoffStrategy::Exponential => backoff_delay(
                attempt,
                retry_delay.unwrap_or(DEFAULT_BASE_DELAY),
                DEFAULT_MAX_DELAY,
            ),
        }
    }
}

impl core::str::FromStr for BackoffStrategy {
    type Err = crate::error::JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "fixed" => Ok(BackoffStrategy::Fixed),
            other => Err(crate::error::JobError::validation(format!(
                "unknown backoff strategy: {other}"
            ))),
        }
    }
}

/// Exponential backoff with jitter drawn uniformly from `[0.5, 1.5)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    backoff_delay_with_jitter(attempt, base, max, jitter)
}

/// `min(base * 2^(attempt-1) * jitter, max)`; attempt 0 counts as attempt 1.
pub fn backoff_delay_with_jitter(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let exponent = attempt.max(1) - 1;
    let base_ms = base.as_millis() as f64;
    let max_ms = max.as_millis() as f64;

    // 2^exponent overflows f64 long after the cap kicks in; clamp the exponent
    // so the multiplication stays finite.
    let factor = 2_f64.powi(exponent.min(64) as i32);
    let delay_ms = (base_ms * factor * jitter).min(max_ms).max(0.0);

    Duration::from_millis(delay_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_without_jitter() {
        let base = Duration::from_millis(1000);
        let max = DEFAULT_MAX_DELAY;

        assert_eq!(backoff_delay_with_jitter(1, base, max, 1.0), Duration::from_millis(1000));
        assert_eq!(backoff_delay_with_jitter(2, base, max, 1.0), Duration::from_millis(2000));
        assert_eq!(backoff_delay_with_jitter(3, base, max, 1.0), Duration::from_millis(4000));
        assert_eq!(backoff_delay_with_jitter(0, base, max, 1.0), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let delay = backoff_delay_with_jitter(40, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, 1.49);
        assert_eq!(delay, DEFAULT_MAX_DELAY);

        let delay = backoff_delay_with_jitter(u32::MAX, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, 1.0);
        assert_eq!(delay, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        for _ in 0..200 {
            let delay = backoff_delay(3, Duration::from_millis(1000), DEFAULT_MAX_DELAY);
            assert!(delay >= Duration::from_millis(2000), "{delay:?}");
            assert!(delay < Duration::from_millis(6000), "{delay:?}");
        }
    }

    #[test]
    fn fixed_strategy_uses_retry_delay() {
        let strategy = BackoffStrategy::Fixed;
        let delay = Duration::from_millis(250);

        assert_eq!(strategy.delay_for(1, Some(delay)), delay);
        assert_eq!(strategy.delay_for(7, Some(delay)), delay);
    }

    #[test]
    fn exponential_strategy_uses_retry_delay_as_base() {
        let strategy = BackoffStrategy::Exponential;
        let delay = strategy.delay_for(1, Some(Duration::from_millis(100)));

        assert!(delay >= Duration::from_millis(50));
        assert!(delay < Duration::from_millis(150));
    }
}
