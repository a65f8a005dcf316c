// =============================================================================
// REST Client — historical candle used to seed the candle aggregators
// =============================================================================

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::types::{Candle, CandleInterval};

/// Source of the bar an aggregator starts from.
///
/// `Ok(None)` means "no seed available"; the aggregator treats errors the
/// same way.
pub trait CandleSeeder: Send + Sync + 'static {
    fn latest_candle(
        &self,
        market: &str,
        interval: CandleInterval,
    ) -> BoxFuture<'static, Result<Option<Candle>>>;
}

/// Seeder that never has history (tests, offline replays).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSeed;

impl CandleSeeder for NoSeed {
    fn latest_candle(
        &self,
        _market: &str,
        _interval: CandleInterval,
    ) -> BoxFuture<'static, Result<Option<Candle>>> {
        Box::pin(async { Ok(None) })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ApiCandle {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    /// Bucket start in milliseconds.
    time: f64,
}

/// Public candles endpoint client.
#[derive(Clone)]
pub struct RestCandleSeeder {
    base_url: String,
    client: reqwest::Client,
}

impl RestCandleSeeder {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "RestCandleSeeder initialised");

        Ok(Self { base_url, client })
    }

    /// `{base}/markets/{market}/candles?resolution={secs}` with the market
    /// percent-encoded as a single path segment (`BTC/USD` → `BTC%2FUSD`).
    pub fn candles_url(&self, market: &str, interval: CandleInterval) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid REST base url {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("REST base url cannot carry a path"))?
            .pop_if_empty()
            .extend(["markets", market, "candles"]);
        url.query_pairs_mut()
            .append_pair("resolution", &interval.as_secs().to_string());
        Ok(url)
    }

    /// GET the candle history and return its last bar.
    #[instrument(skip(self), name = "rest::fetch_latest_candle")]
    pub async fn fetch_latest_candle(
        &self,
        market: &str,
        interval: CandleInterval,
    ) -> Result<Option<Candle>> {
        let url = self.candles_url(market, interval)?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET /markets/{market}/candles request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("GET /markets/{market}/candles returned {status}");
        }

        let body: ApiResponse<Vec<ApiCandle>> = resp
            .json()
            .await
            .context("failed to parse candles response")?;

        let candle = body.result.last().map(|c| Candle {
            symbol: market.to_string(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            timestamp: c.time as i64,
        });

        debug!(market, interval = %interval, seeded = candle.is_some(), "candle history fetched");
        Ok(candle)
    }
}

impl CandleSeeder for RestCandleSeeder {
    fn latest_candle(
        &self,
        market: &str,
        interval: CandleInterval,
    ) -> BoxFuture<'static, Result<Option<Candle>>> {
        let this = self.clone();
        let market = market.to_string();
        Box::pin(async move { this.fetch_latest_candle(&market, interval).await })
    }
}

impl std::fmt::Debug for RestCandleSeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCandleSeeder")
            .field("base_url", &self.base_url)
            .finish()
    }
}
