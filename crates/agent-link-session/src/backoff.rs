//! Reconnect backoff policy.

use std::time::Duration;

use agent_link_core::ReconnectConfig;
use rand::Rng;

/// Exponential backoff with additive jitter and a hard cap.
///
/// `delay(n) = min(base * 2^(n-1) + jitter, max)` with `jitter` drawn from
/// `[0, max_jitter]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
}

impl Backoff {
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Attempts allowed per disconnect episode.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    #[must_use]
    pub const fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.config.max_attempts
    }

    /// Delay before `attempt` (1-based) with an explicit jitter.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt
            .clamp(1, self.config.max_attempts.max(1))
            .saturating_sub(1)
            .min(31);
        let base = self.config.base_delay().saturating_mul(1u32 << exponent);
        let jitter = jitter.min(self.config.max_jitter());
        base.saturating_add(jitter).min(self.config.max_delay())
    }

    /// Delay before `attempt` (1-based) with random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_jitter = u64::try_from(self.config.max_jitter().as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = rand::rng().random_range(0..=max_jitter);
        self.delay_with_jitter(attempt, Duration::from_millis(jitter_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_window() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.delay_with_jitter(1, Duration::ZERO),
            Duration::from_secs(1)
        );
        assert_eq!(
            backoff.delay_with_jitter(1, Duration::from_secs(5)),
            Duration::from_millis(1500)
        );
        for _ in 0..100 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_doubling_until_cap() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| {
                u64::try_from(backoff.delay_with_jitter(n, Duration::ZERO).as_millis()).unwrap()
            })
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(
            backoff.delay_with_jitter(5, Duration::from_millis(500)),
            Duration::from_secs(16)
        );
        assert_eq!(
            backoff.delay_with_jitter(40, Duration::ZERO),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn test_random_delays_non_decreasing() {
        let backoff = Backoff::default();
        for _ in 0..50 {
            let delays: Vec<Duration> = (1..=8).map(|n| backoff.delay(n)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
            assert!(delays.iter().all(|d| *d <= Duration::from_secs(16)));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let backoff = Backoff::default();
        assert!(backoff.allows(0));
        assert!(backoff.allows(4));
        assert!(!backoff.allows(5));
        assert_eq!(backoff.max_attempts(), 5);
    }
}
