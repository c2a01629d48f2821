//! Configuration primitives shared across crates

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration with exponential backoff
///
/// Delays are stored in milliseconds so the struct reads naturally from YAML,
/// TOML or environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between attempts in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, String> {
        let config = Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff_multiplier,
        };
        config.validate()?;
        Ok(config)
    }

    /// Retry configuration for the byte transfer stage
    pub fn transfer_default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Retry configuration for store and bookkeeping stages
    pub fn service_default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }

    /// A configuration that never waits, handy for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 2.0,
        }
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("Backoff multiplier must be at least 1.0".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("Initial delay cannot be greater than max delay".to_string());
        }
        Ok(())
    }

    /// Initial delay as a [`Duration`]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay as a [`Duration`]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Calculate the delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay();
        }

        let delay_ms =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::service_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(
            5,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        )
        .unwrap();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::new(0, Duration::ZERO, Duration::ZERO, 2.0).is_err());
        assert!(
            RetryConfig::new(3, Duration::from_secs(2), Duration::from_secs(1), 2.0).is_err()
        );
        assert!(RetryConfig::transfer_default().validate().is_ok());
        assert!(RetryConfig::service_default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn test_delay_never_exceeds_max(attempt in 0u32..1000) {
            let config = RetryConfig::transfer_default();
            prop_assert!(config.delay_for_attempt(attempt) <= config.max_delay());
        }
    }
}
