use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::events::{candle_topic, ticker_topic, trades_topic, EventBus, FeedEvent, ListenerId};
use crate::exchange::CandleSeeder;
use crate::runtime_config::{Bucketing, CandleSource, FeedConfig};
use crate::types::{Candle, CandleInterval};

const MS_PER_DAY: i64 = 86_400_000;

// ---------------------------------------------------------------------------
// Bucketing state machines
// ---------------------------------------------------------------------------

/// One observation folded into a bar. Trades are single points; a ticker
/// also carries its bid/ask so the bar's range covers the quoted spread.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tick {
    price: f64,
    low: f64,
    high: f64,
}

impl Tick {
    fn point(price: f64) -> Self {
        Self { price, low: price, high: price }
    }

    /// `last` drives open/close. Non-positive or crossed quotes are ignored.
    fn quote(last: f64, bid: f64, ask: f64) -> Self {
        let mut tick = Self::point(last);
        if bid > 0.0 && ask > 0.0 && bid <= ask {
            tick.low = tick.low.min(bid);
            tick.high = tick.high.max(ask);
        }
        tick
    }

    fn open(self, market: &str, ts: i64) -> Candle {
        let mut candle = Candle::opened_at(market, self.price, ts);
        candle.high = self.high;
        candle.low = self.low;
        candle
    }

    fn fold_into(self, candle: &mut Candle, ts: i64) {
        candle.absorb(self.price, ts);
        candle.high = candle.high.max(self.high);
        candle.low = candle.low.min(self.low);
    }
}

impl From<f64> for Tick {
    fn from(price: f64) -> Self {
        Self::point(price)
    }
}

/// In-progress bar plus the bucket it belongs to.
#[derive(Debug, Default, Clone)]
struct BucketState {
    current: Option<Candle>,
    bucket: Option<i64>,
}

/// Rolling bucketing: bucket index = `floor(ts / interval)`. A change of index
/// closes the in-progress bar; the crossing event opens the next one.
fn roll_bucket(
    state: &mut BucketState,
    market: &str,
    interval_ms: i64,
    ts: i64,
    tick: impl Into<Tick>,
) -> Option<Candle> {
    let tick = tick.into();
    let index = ts.div_euclid(interval_ms);

    let completed = match state.bucket {
        Some(prev) if prev == index => None,
        Some(_) => state.current.take(),
        // First event of this epoch: keep a seed from the same bucket so it is
        // merged, close a seed from an older one.
        None => match &state.current {
            Some(seed) if seed.timestamp.div_euclid(interval_ms) != index => state.current.take(),
            _ => None,
        },
    };

    state.bucket = Some(index);
    match state.current.as_mut() {
        Some(candle) => tick.fold_into(candle, ts),
        None => state.current = Some(tick.open(market, ts)),
    }
    completed
}

/// Calendar bucketing for sparse ticks: boundaries are aligned on the UTC day
/// and an event only opens/closes a bar when it lands within `tolerance_ms`
/// of a boundary.
fn calendar_bucket(
    state: &mut BucketState,
    market: &str,
    interval_ms: i64,
    tolerance_ms: i64,
    ts: i64,
    tick: impl Into<Tick>,
) -> Option<Candle> {
    let tick = tick.into();
    let day_start = ts - ts.rem_euclid(MS_PER_DAY);
    let mut next_boundary = day_start;
    while next_boundary < ts {
        next_boundary += interval_ms;
    }
    let bucket_start = next_boundary - interval_ms;

    if (ts - bucket_start).abs() <= tolerance_ms {
        state.current = Some(tick.open(market, ts));
        state.bucket = Some(bucket_start);
        return None;
    }

    if (ts - next_boundary).abs() <= tolerance_ms {
        let mut candle = state.current.take()?;
        tick.fold_into(&mut candle, ts);
        state.bucket = None;
        return Some(candle);
    }

    if ts > bucket_start + tolerance_ms && ts < next_boundary - tolerance_ms {
        if let Some(candle) = state.current.as_mut() {
            tick.fold_into(candle, ts);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// CandleAggregator
// ---------------------------------------------------------------------------

/// Builds `interval` bars for one market from the connection's internal
/// trades or ticker stream and publishes completed bars on
/// `candle-{market}-{interval}`.
///
/// State is only valid for one connection epoch: the owning subscription
/// resets the aggregator and builds a fresh one on reconnect.
pub struct CandleAggregator {
    market: String,
    interval: CandleInterval,
    source: CandleSource,
    bucketing: Bucketing,
    tolerance_ms: i64,
    bus: Arc<EventBus>,
    internal: Arc<EventBus>,
    seeder: Arc<dyn CandleSeeder>,
    state: Mutex<BucketState>,
    listener: Mutex<Option<ListenerId>>,
    detached: AtomicBool,
}

impl CandleAggregator {
    pub fn new(
        market: impl Into<String>,
        interval: CandleInterval,
        config: &FeedConfig,
        bus: Arc<EventBus>,
        internal: Arc<EventBus>,
        seeder: Arc<dyn CandleSeeder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            market: market.into(),
            interval,
            source: config.candle_source,
            bucketing: config.bucketing,
            tolerance_ms: config.boundary_tolerance_ms,
            bus,
            internal,
            seeder,
            state: Mutex::new(BucketState::default()),
            listener: Mutex::new(None),
            detached: AtomicBool::new(false),
        })
    }

    /// Internal-bus topic this aggregator listens on.
    pub fn feed_topic(&self) -> String {
        match self.source {
            CandleSource::Trades => trades_topic(&self.market),
            CandleSource::Ticker => ticker_topic(&self.market),
        }
    }

    /// Copy of the in-progress bar.
    pub fn current(&self) -> Option<Candle> {
        self.state.lock().current.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Seed the in-progress bar from history, then attach to the feed.
    ///
    /// A failed or empty fetch leaves the aggregator unseeded. If `reset` ran
    /// while the fetch was in flight the aggregator stays detached.
    pub async fn launch(self: Arc<Self>) {
        match self.seeder.latest_candle(&self.market, self.interval).await {
            Ok(Some(seed)) => {
                debug!(market = %self.market, interval = %self.interval, ts = seed.timestamp, "candle seeded");
                self.state.lock().current = Some(seed);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(market = %self.market, error = %e, "candle seed unavailable");
            }
        }

        if self.detached.load(Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(&self);
        let id = self.internal.on(self.feed_topic(), move |event| {
            if let Some(aggregator) = weak.upgrade() {
                aggregator.on_event(event);
            }
        });
        *self.listener.lock() = Some(id);

        // reset() may have raced with the registration above.
        if self.detached.load(Ordering::SeqCst) {
            self.detach();
            return;
        }

        info!(market = %self.market, interval = %self.interval, topic = %self.feed_topic(), "candle aggregator attached");
    }

    /// Detach from the feed. Idempotent.
    pub fn reset(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.detach();
    }

    fn detach(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.internal.off(id);
            debug!(market = %self.market, interval = %self.interval, "candle aggregator detached");
        }
    }

    fn on_event(&self, event: &FeedEvent) {
        match event {
            FeedEvent::Trades(trades) => {
                for trade in trades {
                    self.ingest(trade.timestamp, trade.price);
                }
            }
            FeedEvent::Ticker(ticker) => {
                self.ingest_tick(ticker.timestamp, Tick::quote(ticker.last, ticker.bid, ticker.ask));
            }
            _ => {}
        }
    }

    /// Fold one price observation in; publishes and returns the completed bar
    /// when a bucket closes.
    pub fn ingest(&self, timestamp: i64, price: f64) -> Option<Candle> {
        self.ingest_tick(timestamp, Tick::point(price))
    }

    fn ingest_tick(&self, timestamp: i64, tick: Tick) -> Option<Candle> {
        let interval_ms = self.interval.as_millis();
        let completed = {
            let mut state = self.state.lock();
            match self.bucketing {
                Bucketing::Rolling => roll_bucket(&mut state, &self.market, interval_ms, timestamp, tick),
                Bucketing::Calendar => calendar_bucket(
                    &mut state,
                    &self.market,
                    interval_ms,
                    self.tolerance_ms,
                    timestamp,
                    tick,
                ),
            }
        };

        if let Some(candle) = &completed {
            debug!(
                market = %self.market,
                interval = %self.interval,
                open = candle.open,
                close = candle.close,
                "candle completed"
            );
            self.bus.emit(
                &candle_topic(&self.market, self.interval),
                FeedEvent::Candle(candle.clone()),
            );
        }
        completed
    }
}

impl std::fmt::Debug for CandleAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleAggregator")
            .field("market", &self.market)
            .field("interval", &self.interval)
            .field("bucketing", &self.bucketing)
            .field("attached", &self.is_attached())
            .finish()
    }
}
