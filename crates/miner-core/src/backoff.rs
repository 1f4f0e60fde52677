//! Reconnect backoff configuration and delay calculation.
//!
//! The event-bus client sleeps between reconnection attempts using capped
//! exponential backoff with symmetric jitter:
//!
//! `min(max_delay, base_delay * 2^attempt) * (1 + (2r - 1) * jitter)`
//!
//! where `r` is drawn uniformly from `[0, 1)`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Parameters of the reconnect backoff curve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay before the first retry in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the un-jittered delay in ms (default: 60000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Backoff delay for a zero-based `attempt` with an explicit random value.
///
/// `random` should be in `[0.0, 1.0)`; values outside are clamped. The
/// jitter factor is clamped to `[0.0, 1.0]` so the delay is never negative.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay(attempt: u32, config: &BackoffConfig, random: f64) -> Duration {
    let exponential = config
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(config.max_delay_ms);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    let random = random.clamp(0.0, 1.0);
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor;
    let with_jitter = (capped as f64) * jitter;

    Duration::from_millis(with_jitter.round().max(0.0) as u64)
}

/// Backoff delay for `attempt` using the thread-local PRNG.
#[must_use]
pub fn next_backoff_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    backoff_delay(attempt, config, rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn config_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert!((config.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn config_serde_defaults() {
        let config: BackoffConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BackoffConfig::default());
    }

    #[test]
    fn config_camel_case_fields() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{"baseDelayMs": 250, "maxDelayMs": 5000}"#).unwrap();
        assert_eq!(config.base_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 5000);
    }

    #[test]
    fn exponential_growth() {
        let config = no_jitter();
        assert_eq!(backoff_delay(0, &config, 0.5), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1, &config, 0.5), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2, &config, 0.5), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3, &config, 0.5), Duration::from_millis(8000));
    }

    #[test]
    fn caps_at_max() {
        let config = no_jitter();
        assert_eq!(backoff_delay(10, &config, 0.5), Duration::from_millis(60_000));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let config = no_jitter();
        assert_eq!(
            backoff_delay(u32::MAX, &config, 0.5),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn jitter_bounds() {
        let config = BackoffConfig {
            jitter_factor: 0.2,
            ..no_jitter()
        };
        assert_eq!(backoff_delay(0, &config, 0.0), Duration::from_millis(800));
        assert_eq!(backoff_delay(0, &config, 0.5), Duration::from_millis(1000));
        assert_eq!(backoff_delay(0, &config, 1.0), Duration::from_millis(1200));
    }

    #[test]
    fn jitter_factor_is_clamped() {
        let config = BackoffConfig {
            jitter_factor: 5.0,
            ..no_jitter()
        };
        assert_eq!(backoff_delay(0, &config, 0.0), Duration::ZERO);
    }

    #[test]
    fn random_delay_stays_in_range() {
        let config = BackoffConfig::default();
        for attempt in 0..8 {
            let delay = next_backoff_delay(attempt, &config);
            assert!(delay <= Duration::from_millis(72_000));
        }
    }
}
