// =============================================================================
// Shared types used across the feed client
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::market_data::CandleAggregator;

/// Normalise a caller-supplied symbol into the exchange market form
/// (`BTC-USD` and `BTC/USD` both become `BTC/USD`).
pub fn format_market(symbol: &str) -> String {
    symbol.replacen('-', "/", 1)
}

// ---------------------------------------------------------------------------
// Market events
// ---------------------------------------------------------------------------

/// Best bid/ask snapshot for a market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask_size: f64,
    pub last: f64,
    /// Exchange time in milliseconds since the epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub id: u64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    #[serde(default)]
    pub liquidation: bool,
    /// Exchange time in milliseconds since the epoch.
    pub timestamp: i64,
}

/// OHLC bar. Emitted as a copy once its bucket is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Timestamp of the latest event folded into the bar (ms).
    pub timestamp: i64,
}

impl Candle {
    /// Start a bar from a single price observation.
    pub fn opened_at(symbol: impl Into<String>, price: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            open: price,
            high: price,
            low: price,
            close: price,
            timestamp,
        }
    }

    /// Fold one more price observation into the bar.
    pub fn absorb(&mut self, price: f64, timestamp: i64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.timestamp = timestamp;
    }
}

// ---------------------------------------------------------------------------
// Channels and intervals
// ---------------------------------------------------------------------------

/// Wire channel of a plain market-data subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedChannel {
    Ticker,
    Trades,
}

impl FeedChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trades => "trades",
        }
    }
}

impl std::fmt::Display for FeedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle intervals accepted by `subscribe_candle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "15s")]
    FifteenSeconds,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl CandleInterval {
    pub const ALL: [CandleInterval; 7] = [
        Self::FifteenSeconds,
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FifteenSeconds => "15s",
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    pub fn as_secs(self) -> i64 {
        match self {
            Self::FifteenSeconds => 15,
            Self::OneMinute => 60,
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::OneHour => 3_600,
            Self::FourHours => 14_400,
            Self::OneDay => 86_400,
        }
    }

    pub fn as_millis(self) -> i64 {
        self.as_secs() * 1_000
    }

    /// Comma-separated list used in validation errors.
    pub fn allowed_list() -> String {
        Self::ALL
            .iter()
            .map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for CandleInterval {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| FeedError::InvalidInterval {
                given: s.to_string(),
                allowed: Self::allowed_list(),
            })
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// One record in a connection's subscription list.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    /// Market in exchange form (`BTC/USD`).
    pub symbol: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SubscriptionKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubscriptionKind {
    Ticker {
        implied_by_candle: bool,
    },
    Trades {
        implied_by_candle: bool,
    },
    Candle {
        interval: CandleInterval,
        #[serde(skip_serializing)]
        aggregator: Arc<CandleAggregator>,
    },
}

impl Subscription {
    pub fn feed(symbol: impl Into<String>, channel: FeedChannel, implied_by_candle: bool) -> Self {
        let kind = match channel {
            FeedChannel::Ticker => SubscriptionKind::Ticker { implied_by_candle },
            FeedChannel::Trades => SubscriptionKind::Trades { implied_by_candle },
        };
        Self {
            symbol: symbol.into(),
            created_at: Utc::now(),
            kind,
        }
    }

    pub fn candle(
        symbol: impl Into<String>,
        interval: CandleInterval,
        aggregator: Arc<CandleAggregator>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            created_at: Utc::now(),
            kind: SubscriptionKind::Candle {
                interval,
                aggregator,
            },
        }
    }

    /// Wire channel for ticker/trades records, `None` for candles.
    pub fn channel(&self) -> Option<FeedChannel> {
        match self.kind {
            SubscriptionKind::Ticker { .. } => Some(FeedChannel::Ticker),
            SubscriptionKind::Trades { .. } => Some(FeedChannel::Trades),
            SubscriptionKind::Candle { .. } => None,
        }
    }

    pub fn implied_by_candle(&self) -> bool {
        match self.kind {
            SubscriptionKind::Ticker { implied_by_candle }
            | SubscriptionKind::Trades { implied_by_candle } => implied_by_candle,
            SubscriptionKind::Candle { .. } => false,
        }
    }

    pub fn is_feed(&self, channel: FeedChannel, market: &str) -> bool {
        self.symbol == market && self.channel() == Some(channel)
    }

    pub fn is_candle(&self, market: &str, wanted: CandleInterval) -> bool {
        matches!(self.kind, SubscriptionKind::Candle { interval, .. } if interval == wanted)
            && self.symbol == market
    }
}
