//! Runtime configuration of a single client.

use std::time::Duration;

use miner_core::BackoffConfig;
use miner_settings::PubSubSettings;

/// Timeouts, intervals and limits for one [`crate::PubSubClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket URI of the event bus.
    pub url: String,
    /// Bound on opening the socket and on `connect()` waiting for it.
    pub connect_timeout: Duration,
    /// Bound on waiting for a correlated reply.
    pub request_timeout: Duration,
    /// Bound on the close handshake.
    pub close_timeout: Duration,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Silence after which the link is presumed dead.
    pub liveness_timeout: Duration,
    /// How often expired pending requests are evicted.
    pub sweep_interval: Duration,
    /// Topics allowed on this connection.
    pub max_topics: usize,
    /// Reconnect delay curve.
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &PubSubSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            close_timeout: Duration::from_millis(settings.close_timeout_ms),
            ping_interval: Duration::from_millis(settings.ping_interval_ms),
            liveness_timeout: Duration::from_millis(settings.liveness_timeout_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            max_topics: settings.max_topics_per_connection,
            backoff: settings.reconnect.clone(),
        }
    }

    /// Same settings against another endpoint.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_settings(&PubSubSettings::default())
    }
}
