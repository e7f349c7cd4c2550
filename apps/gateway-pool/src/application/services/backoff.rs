//! Retry Backoff
//!
//! Exponential backoff with jitter, shared by handshake retries (a fresh
//! session id per attempt) and request dispatch retries.

use std::time::Duration;

use rand::Rng;

/// Configuration for a backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.2 = ±20%).
    pub jitter_factor: f64,
    /// Retries allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 3,
        }
    }
}

impl BackoffConfig {
    /// Create a configuration with custom values.
    #[must_use]
    pub const fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor,
            max_attempts,
        }
    }

    /// Same schedule without jitter.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Longest single delay the schedule can produce, jitter included.
    #[must_use]
    pub fn longest_delay(&self) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let ceiling =
            (self.max_delay.as_millis() as f64 * (1.0 + self.jitter_factor.clamp(0.0, 1.0))).ceil();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = ceiling as u64;
        Duration::from_millis(millis)
    }
}

/// Stateful backoff schedule for one operation.
///
/// ```rust
/// use gateway_pool::application::services::backoff::{Backoff, BackoffConfig};
///
/// let mut backoff = Backoff::new(BackoffConfig::default());
/// assert!(backoff.next_delay().is_some());
/// backoff.reset();
/// assert_eq!(backoff.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl Backoff {
    /// Start a schedule.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            attempt_count: 0,
        }
    }

    /// Get the next delay, or `None` once the attempt ceiling is reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.apply_jitter(self.current_delay.min(self.config.max_delay));

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Restart the schedule after a success.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Retries taken so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || duration.is_zero() {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = adjusted_millis as u64;
        Duration::from_millis(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            2.0,
            0.0,
            max_attempts,
        )
    }

    #[test]
    fn grows_exponentially_until_capped() {
        let mut backoff = Backoff::new(config(0));
        let delays: Vec<u128> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn stops_at_attempt_ceiling() {
        let mut backoff = Backoff::new(config(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(!backoff.should_retry());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut backoff = Backoff::new(BackoffConfig {
                jitter_factor: 0.2,
                ..config(0)
            });
            let millis = backoff.next_delay().unwrap().as_millis();
            assert!((80..=120).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn initial_delay_above_cap_is_capped() {
        let mut backoff = Backoff::new(BackoffConfig::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            2.0,
            0.0,
            0,
        ));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn longest_delay_bounds_every_delay() {
        let config = BackoffConfig {
            jitter_factor: 0.2,
            ..config(8)
        };
        assert!(config.longest_delay() >= Duration::from_millis(1200));

        let mut backoff = Backoff::new(config);
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= config.longest_delay(), "{delay:?}");
        }
    }
}
