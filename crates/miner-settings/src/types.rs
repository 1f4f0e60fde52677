//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial user file only needs
//! the keys it overrides.

use miner_core::BackoffConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Platform limit on topics per event-bus connection.
pub const PLATFORM_MAX_TOPICS: usize = 50;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MinerSettings {
    /// Event-bus client tuning.
    pub pubsub: PubSubSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Which account and channels to watch.
    pub account: AccountSettings,
}

impl MinerSettings {
    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pubsub;
        if !(p.url.starts_with("ws://") || p.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "pubsub.url must be a ws:// or wss:// URI, got {}",
                p.url
            )));
        }
        if p.ping_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "pubsub.pingIntervalMs must be positive".into(),
            ));
        }
        if p.liveness_timeout_ms < p.ping_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "pubsub.livenessTimeoutMs ({}) is shorter than pingIntervalMs ({})",
                p.liveness_timeout_ms, p.ping_interval_ms
            )));
        }
        if p.max_topics_per_connection == 0 || p.max_topics_per_connection > PLATFORM_MAX_TOPICS {
            return Err(SettingsError::InvalidValue(format!(
                "pubsub.maxTopicsPerConnection must be within 1..={PLATFORM_MAX_TOPICS}"
            )));
        }
        for (name, value) in [
            ("connectTimeoutMs", p.connect_timeout_ms),
            ("requestTimeoutMs", p.request_timeout_ms),
            ("sweepIntervalMs", p.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "pubsub.{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Event-bus client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PubSubSettings {
    /// Base WebSocket URI of the event bus.
    pub url: String,
    /// Upper bound on a single `connect()` wait.
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for a correlated reply.
    pub request_timeout_ms: u64,
    /// Upper bound on the graceful close handshake.
    pub close_timeout_ms: u64,
    /// Interval between keepalive pings.
    pub ping_interval_ms: u64,
    /// Silence longer than this marks the link dead.
    pub liveness_timeout_ms: u64,
    /// How often expired pending requests are evicted.
    pub sweep_interval_ms: u64,
    /// Topics allowed on one connection.
    pub max_topics_per_connection: usize,
    /// Reconnect backoff curve.
    pub reconnect: BackoffConfig,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            url: "wss://pubsub-edge.twitch.tv/v1".to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
            ping_interval_ms: 30_000,
            liveness_timeout_ms: 90_000,
            sweep_interval_ms: 1_000,
            max_topics_per_connection: PLATFORM_MAX_TOPICS,
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Account and channel selection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountSettings {
    /// Numeric id of the logged-in user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Channel ids to follow.
    pub channels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: MinerSettings =
            serde_json::from_str(r#"{"pubsub": {"pingIntervalMs": 5000}}"#).unwrap();
        assert_eq!(settings.pubsub.ping_interval_ms, 5000);
        assert_eq!(settings.pubsub.liveness_timeout_ms, 90_000);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn reconnect_is_nested_camel_case() {
        let settings: PubSubSettings =
            serde_json::from_str(r#"{"reconnect": {"maxDelayMs": 5000}}"#).unwrap();
        assert_eq!(settings.reconnect.max_delay_ms, 5000);
        assert_eq!(settings.reconnect.base_delay_ms, 1000);
    }

    #[test]
    fn account_user_id_skipped_when_none() {
        let json = serde_json::to_value(AccountSettings::default()).unwrap();
        assert!(json.get("userId").is_none());
        assert_eq!(json["channels"], serde_json::json!([]));
    }

    #[test]
    fn defaults_validate() {
        assert!(MinerSettings::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_url() {
        let mut settings = MinerSettings::default();
        settings.pubsub.url = "https://example.com".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("ws://"));
    }

    #[test]
    fn validate_rejects_liveness_shorter_than_ping() {
        let mut settings = MinerSettings::default();
        settings.pubsub.liveness_timeout_ms = 1000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_topic_cap_over_platform_limit() {
        let mut settings = MinerSettings::default();
        settings.pubsub.max_topics_per_connection = 51;
        assert!(settings.validate().is_err());
        settings.pubsub.max_topics_per_connection = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_request_timeout() {
        let mut settings = MinerSettings::default();
        settings.pubsub.request_timeout_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("requestTimeoutMs"));
    }
}
