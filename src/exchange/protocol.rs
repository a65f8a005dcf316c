// =============================================================================
// Wire protocol — JSON frames exchanged over the feed websocket
// =============================================================================
//
// Outbound:
//   { "op": "subscribe" | "unsubscribe", "channel": "ticker" | "trades", "market": "BTC/USD" }
//   { "op": "ping" }
//
// Inbound:
//   { "type": "subscribed" | "unsubscribed" | "update" | "error" | "pong" | ...,
//     "channel"?, "market"?, "data"?, "msg"? }
// =============================================================================

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::types::{FeedChannel, Side, Ticker, Trade};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum OutboundFrame {
    Subscribe { channel: FeedChannel, market: String },
    Unsubscribe { channel: FeedChannel, market: String },
    Ping,
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialise outbound frame")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse inbound frame")
    }

    /// `type-channel-market` when the frame names both, else just `type`
    /// (connection-level replies such as `pong`).
    pub fn correlation_key(&self) -> String {
        match (self.channel.as_deref(), self.market.as_deref()) {
            (Some(channel), Some(market)) if !channel.is_empty() && !market.is_empty() => {
                format!("{}-{}-{}", self.kind, channel, market)
            }
            _ => self.kind.clone(),
        }
    }

    pub fn is_update(&self, channel: FeedChannel) -> bool {
        self.kind == "update" && self.channel.as_deref() == Some(channel.as_str())
    }
}

/// Correlation key of the reply to a (un)subscribe request, e.g.
/// `subscribed-ticker-BTC/USD`.
pub fn ack_key(reply: &str, channel: FeedChannel, market: &str) -> String {
    format!("{reply}-{channel}-{market}")
}

pub const PONG_KEY: &str = "pong";

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Numbers may arrive as JSON numbers or numeric strings.
fn parse_number(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse a ticker update payload.
///
/// Expected shape:
/// ```json
/// { "bid": 37000.0, "ask": 37001.0, "bidSize": 1.2, "askSize": 0.4, "last": 37000.5, "time": 1700000000.123 }
/// ```
pub fn parse_ticker(market: &str, data: &serde_json::Value) -> Result<Ticker> {
    let bid = parse_number(&data["bid"], "bid")?;
    let ask = parse_number(&data["ask"], "ask")?;
    let bid_size = parse_number(&data["bidSize"], "bidSize").unwrap_or(0.0);
    let ask_size = parse_number(&data["askSize"], "askSize").unwrap_or(0.0);
    // `last` is null on markets that have not traded yet.
    let last = parse_number(&data["last"], "last").unwrap_or((bid + ask) / 2.0);
    let time = parse_number(&data["time"], "time")?;

    Ok(Ticker {
        symbol: market.to_string(),
        bid,
        ask,
        bid_size,
        ask_size,
        last,
        timestamp: (time * 1_000.0) as i64,
    })
}

/// Parse a trades update payload.
///
/// Expected shape:
/// ```json
/// [{ "id": 1, "price": 37000.0, "size": 0.1, "side": "buy", "liquidation": false,
///    "time": "2021-05-01T12:00:00.123456+00:00" }]
/// ```
pub fn parse_trades(market: &str, data: &serde_json::Value) -> Result<Vec<Trade>> {
    let raw = data.as_array().context("trades payload is not an array")?;

    raw.iter()
        .map(|entry| {
            let id = entry["id"].as_u64().context("missing field id")?;
            let price = parse_number(&entry["price"], "price")?;
            let size = parse_number(&entry["size"], "size")?;
            let side = match entry["side"].as_str().context("missing field side")? {
                "buy" => Side::Buy,
                "sell" => Side::Sell,
                other => anyhow::bail!("unknown trade side '{other}'"),
            };
            let liquidation = entry["liquidation"].as_bool().unwrap_or(false);
            let time = entry["time"].as_str().context("missing field time")?;
            let timestamp = DateTime::parse_from_rfc3339(time)
                .with_context(|| format!("failed to parse trade time '{time}'"))?
                .timestamp_millis();

            Ok(Trade {
                symbol: market.to_string(),
                id,
                price,
                size,
                side,
                liquidation,
                timestamp,
            })
        })
        .collect()
}
