// =============================================================================
// feed-mux — demo entry point
// =============================================================================
//
// Connects to the configured exchange feed, subscribes to tickers and candles
// for a handful of markets and logs everything that comes back until Ctrl-C.
// =============================================================================

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feed_mux::events::{
    candle_topic, ticker_topic, TOPIC_ERROR, TOPIC_RECONNECT, TOPIC_RECONNECT_CANDLE,
    TOPIC_RETRY_SUBSCRIPTION, TOPIC_SOCKET_NOT_READY,
};
use feed_mux::{CandleInterval, FeedClient, FeedConfig, FeedEvent};

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });

    if let Ok(url) = std::env::var("FEED_WS_URL") {
        config.ws_url = url;
    }
    if let Ok(url) = std::env::var("FEED_REST_URL") {
        config.rest_url = url;
    }

    let symbols: Vec<String> = std::env::var("FEED_SYMBOLS")
        .map(|syms| {
            syms.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| vec!["BTC-PERP".into(), "ETH-PERP".into(), "BTC/USD".into()]);

    let interval: CandleInterval = std::env::var("FEED_CANDLE_INTERVAL")
        .unwrap_or_else(|_| "1m".to_string())
        .parse()?;

    info!(
        ws_url = %config.ws_url,
        symbols = ?symbols,
        interval = %interval,
        max_subscriptions = config.max_subscriptions,
        "feed-mux starting"
    );

    // ── 2. Client & listeners ────────────────────────────────────────────
    let client = FeedClient::connect_default(config.clone())?;
    let bus = client.events();

    bus.on(TOPIC_ERROR, |event| {
        if let FeedEvent::Error(msg) = event {
            error!(error = %msg, "feed error");
        }
    });
    for topic in [TOPIC_RECONNECT, TOPIC_SOCKET_NOT_READY, TOPIC_RETRY_SUBSCRIPTION, TOPIC_RECONNECT_CANDLE] {
        bus.on(topic, move |event| warn!(topic, ?event, "connection event"));
    }

    for symbol in &symbols {
        let market = feed_mux::types::format_market(symbol);
        bus.on(ticker_topic(&market), |event| {
            if let FeedEvent::Ticker(t) = event {
                info!(market = %t.symbol, bid = t.bid, ask = t.ask, last = t.last, "ticker");
            }
        });
        bus.on(candle_topic(&market, interval), |event| {
            if let FeedEvent::Candle(c) = event {
                info!(
                    market = %c.symbol,
                    open = c.open,
                    high = c.high,
                    low = c.low,
                    close = c.close,
                    ts = c.timestamp,
                    "candle"
                );
            }
        });
    }

    // ── 3. Subscriptions ─────────────────────────────────────────────────
    client.subscribe_tickers(&symbols);
    for symbol in &symbols {
        client.subscribe_candle(symbol, interval.as_str())?;
    }

    // ── 4. Wait for shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    info!(subscriptions = client.subscription_count(), "unsubscribing");
    if let Err(e) = client.unsubscribe_tickers(&symbols) {
        warn!(error = %e, "unsubscribe failed");
    }
    for symbol in &symbols {
        if let Err(e) = client.unsubscribe_candle(symbol, interval.as_str()) {
            warn!(error = %e, "candle unsubscribe failed");
        }
    }
    tokio::time::sleep(config.ack_timeout()).await;

    if let Err(e) = client.close_connection() {
        warn!(error = %e, "connections still busy at shutdown");
    }

    info!("feed-mux stopped");
    Ok(())
}
