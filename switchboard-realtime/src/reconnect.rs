//! Reconnection backoff

use rand::Rng;
use std::time::Duration;

use switchboard_config::RealtimeConfig;

/// Capped exponential backoff with optional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl From<&RealtimeConfig> for ReconnectPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-indexed), never above `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let mut delay = scaled.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // ±20%
            delay *= rand::rng().random_range(0.8..1.2);
        }
        Duration::from_secs_f64(delay.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_delays() {
        let policy = policy(false);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy(false);
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = policy(true);
        for attempt in 1..=10 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_secs(30));
            assert!(delay >= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_attempts_are_bounded() {
        let policy = policy(false);
        assert!(policy.allows(0));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn test_from_config() {
        let config = RealtimeConfig {
            max_attempts: 2,
            jitter: false,
            ..Default::default()
        };
        let policy = ReconnectPolicy::from(&config);
        assert_eq!(policy.max_attempts, 2);
        assert!(!policy.jitter);
    }
}
