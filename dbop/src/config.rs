//! Serializable retry configuration.
//!
//! [`RetryPolicyConfig`] is the shape a retry policy takes in an application
//! config file. Durations are plain milliseconds and every field has a
//! default, so a partial section is enough:
//!
//! ```json
//! { "max_retries": 3, "jitter": "full" }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;
use crate::policy::{Jitter, RetryPolicy};

/// Retry policy as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Jitter mode.
    pub jitter: Jitter,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        RetryPolicy::default().into()
    }
}

impl From<RetryPolicy> for RetryPolicyConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_retries: policy.max_retries(),
            initial_delay_ms: duration_millis(policy.initial_delay()),
            max_delay_ms: duration_millis(policy.max_delay()),
            backoff_multiplier: policy.backoff_multiplier().into_inner(),
            jitter: policy.jitter(),
        }
    }
}

impl TryFrom<RetryPolicyConfig> for RetryPolicy {
    type Error = PolicyError;

    fn try_from(config: RetryPolicyConfig) -> Result<Self, Self::Error> {
        Self::builder()
            .max_retries(config.max_retries)
            .initial_delay(Duration::from_millis(config.initial_delay_ms))
            .max_delay(Duration::from_millis(config.max_delay_ms))
            .backoff_multiplier(config.backoff_multiplier)
            .jitter(config.jitter)
            .build()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: RetryPolicyConfig =
            serde_json::from_str(r#"{ "max_retries": 2, "jitter": "none" }"#).unwrap();

        let policy = RetryPolicy::try_from(config).unwrap();

        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.jitter(), Jitter::None);
        assert_eq!(policy.initial_delay(), Duration::from_millis(100));
        assert_eq!(policy.max_delay(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RetryPolicyConfig {
            initial_delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..RetryPolicyConfig::default()
        };

        assert!(matches!(
            RetryPolicy::try_from(config),
            Err(PolicyError::InitialExceedsMax { .. })
        ));
    }

    #[test]
    fn default_config_round_trips_through_the_policy() {
        let config = RetryPolicyConfig::default();
        let policy = RetryPolicy::try_from(config.clone()).unwrap();

        assert_eq!(RetryPolicyConfig::from(policy), config);
        assert_eq!(policy, RetryPolicy::default());
    }
}
