// =============================================================================
// Runtime Configuration — feed endpoints, timings and capacity limits
// =============================================================================
//
// Every tunable of the connection pool lives here. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file, and persistence uses an atomic tmp + rename write.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_ws_url() -> String {
    "wss://ftx.com/ws/".to_string()
}

fn default_rest_url() -> String {
    "https://ftx.com/api".to_string()
}

fn default_max_subscriptions() -> usize {
    98
}

fn default_sweep_interval_ms() -> u64 {
    32_000
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_stale_after_ms() -> u64 {
    6 * 60 * 1_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_subscribe_retry_ms() -> u64 {
    2_000
}

fn default_ack_timeout_ms() -> u64 {
    1_500
}

fn default_command_timeout_ms() -> u64 {
    250
}

fn default_boundary_tolerance_ms() -> i64 {
    500
}

fn default_seed_timeout_ms() -> u64 {
    10_000
}

// =============================================================================
// Candle deployment options
// =============================================================================

/// Which upstream channel feeds the candle aggregators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleSource {
    #[default]
    Trades,
    Ticker,
}

/// How incoming events are assigned to candle buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucketing {
    /// `floor(ts / interval)`; a new bucket index closes the previous bar.
    #[default]
    Rolling,
    /// UTC-day aligned boundaries with a tolerance window, for sparse ticks.
    Calendar,
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Websocket endpoint of the exchange feed.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// REST base used to seed candles from history.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Subscription ceiling per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Period of the pool's dead/stale connection sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Heartbeat period. A connection without a pong for twice this long is
    /// considered dead.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// A symbol with no event for this long is resubscribed.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Delay before reconnecting, and before retrying on a not-ready socket.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Backoff between subscribe attempts.
    #[serde(default = "default_subscribe_retry_ms")]
    pub subscribe_retry_ms: u64,

    /// How long a correlated reply is awaited.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Per-item timeout of the outbound command queue.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default)]
    pub candle_source: CandleSource,

    #[serde(default)]
    pub bucketing: Bucketing,

    /// Half-width of the calendar bucketing windows.
    #[serde(default = "default_boundary_tolerance_ms")]
    pub boundary_tolerance_ms: i64,

    #[serde(default = "default_seed_timeout_ms")]
    pub seed_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            max_subscriptions: default_max_subscriptions(),
            sweep_interval_ms: default_sweep_interval_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            subscribe_retry_ms: default_subscribe_retry_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            candle_source: CandleSource::default(),
            bucketing: Bucketing::default(),
            boundary_tolerance_ms: default_boundary_tolerance_ms(),
            seed_timeout_ms: default_seed_timeout_ms(),
        }
    }
}

impl FeedConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn dead_after(&self) -> Duration {
        self.ping_interval() * 2
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn subscribe_retry(&self) -> Duration {
        Duration::from_millis(self.subscribe_retry_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn seed_timeout(&self) -> Duration {
        Duration::from_millis(self.seed_timeout_ms)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            ws_url = %config.ws_url,
            max_subscriptions = config.max_subscriptions,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp file, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.max_subscriptions, 98);
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(32));
        assert_eq!(cfg.dead_after(), Duration::from_secs(30));
        assert_eq!(cfg.stale_after_ms, 360_000);
        assert_eq!(cfg.ack_timeout(), Duration::from_millis(1_500));
        assert_eq!(cfg.candle_source, CandleSource::Trades);
        assert_eq!(cfg.bucketing, Bucketing::Rolling);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: FeedConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ws_url, "wss://ftx.com/ws/");
        assert_eq!(cfg.subscribe_retry_ms, 2_000);
        assert_eq!(cfg.boundary_tolerance_ms, 500);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "max_subscriptions": 10, "candle_source": "ticker", "bucketing": "calendar" }"#;
        let cfg: FeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_subscriptions, 10);
        assert_eq!(cfg.candle_source, CandleSource::Ticker);
        assert_eq!(cfg.bucketing, Bucketing::Calendar);
        assert_eq!(cfg.ping_interval_ms, 15_000);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = std::env::temp_dir().join(format!("feed-mux-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed_config.json");

        let mut cfg = FeedConfig::default();
        cfg.max_subscriptions = 42;
        cfg.save(&path).unwrap();

        let loaded = FeedConfig::load(&path).unwrap();
        assert_eq!(loaded.max_subscriptions, 42);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(FeedConfig::load("/definitely/not/here.json").is_err());
    }
}
