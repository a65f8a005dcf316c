// =============================================================================
// Feed Client — pool of connection managers behind one subscription API
// =============================================================================
//
// Ticker/trades subscriptions live on the stream managers, candles on the
// candle managers. A new subscription lands on the most recently created
// manager of its list unless that would push it past the per-connection
// ceiling or that manager was closed on request, in which case a fresh
// manager is provisioned and connected.
//
// A periodic sweep force-closes managers that stopped answering pings (their
// own reconnect path takes over) and cycles stale symbols on the others.
//
// Managers are never removed from the lists; the pool only grows for the
// lifetime of the client.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::FeedError;
use crate::events::{EventBus, FeedEvent, TOPIC_SUBSCRIPTIONS};
use crate::exchange::{CandleSeeder, RestCandleSeeder};
use crate::feed::connection::{ChangeHook, ConnectionManager};
use crate::runtime_config::FeedConfig;
use crate::transport::{Connector, WsConnector};
use crate::types::{format_market, CandleInterval, FeedChannel, Subscription};

type ManagerList = RwLock<Vec<Arc<ConnectionManager>>>;

struct PoolInner {
    config: Arc<FeedConfig>,
    connector: Arc<dyn Connector>,
    seeder: Arc<dyn CandleSeeder>,
    bus: Arc<EventBus>,
    streams: ManagerList,
    candles: ManagerList,
}

impl PoolInner {
    /// Reuse the newest manager of `list` if it can take `needed` more
    /// records and was not closed on request, otherwise provision and
    /// connect a new one.
    fn select_manager<F>(self: &Arc<Self>, list: &ManagerList, needed: F) -> Arc<ConnectionManager>
    where
        F: Fn(&ConnectionManager) -> usize,
    {
        let mut managers = list.write();
        if let Some(last) = managers.last() {
            if !last.is_closed_by_request()
                && last.subscription_count() + needed(last) <= self.config.max_subscriptions
            {
                return last.clone();
            }
        }

        let weak = Arc::downgrade(self);
        let hook: ChangeHook = Arc::new(move || {
            if let Some(pool) = weak.upgrade() {
                pool.publish_snapshot();
            }
        });
        let manager = ConnectionManager::new(
            self.config.clone(),
            self.connector.clone(),
            self.seeder.clone(),
            self.bus.clone(),
            Some(hook),
        );
        managers.push(manager.clone());
        info!(connection = %manager.id(), pool_size = managers.len(), "provisioned connection");

        let connecting = manager.clone();
        tokio::spawn(async move { connecting.connect().await });
        manager
    }

    fn all(&self) -> Vec<Arc<ConnectionManager>> {
        let mut all = self.streams.read().clone();
        all.extend(self.candles.read().iter().cloned());
        all
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.all().iter().flat_map(|m| m.subscriptions()).collect()
    }

    fn publish_snapshot(&self) {
        self.bus.emit(TOPIC_SUBSCRIPTIONS, FeedEvent::Subscriptions(self.subscriptions()));
    }

    fn sweep(&self) {
        let now_ms = Utc::now().timestamp_millis();
        for manager in self.all() {
            if !manager.received_pong_recently() {
                warn!(connection = %manager.id(), "no pong within the dead threshold, forcing close");
                manager.force_close();
            } else {
                manager.check_stale_subscriptions(now_ms);
            }
        }
    }
}

/// Entry point for consumers: subscribe, unsubscribe and listen on
/// [`FeedClient::events`].
pub struct FeedClient {
    inner: Arc<PoolInner>,
    sweep: JoinHandle<()>,
}

impl FeedClient {
    /// Build a client on explicit collaborators. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: FeedConfig,
        connector: Arc<dyn Connector>,
        seeder: Arc<dyn CandleSeeder>,
        bus: Arc<EventBus>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            config: Arc::new(config),
            connector,
            seeder,
            bus,
            streams: RwLock::new(Vec::new()),
            candles: RwLock::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let period = inner.config.sweep_interval();
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                pool.sweep();
            }
        });

        Self { inner, sweep }
    }

    /// Client on the websocket transport with REST candle seeding.
    pub fn connect_default(config: FeedConfig) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(config.handshake_timeout()));
        let seeder = Arc::new(RestCandleSeeder::new(config.rest_url.clone(), config.seed_timeout())?);
        Ok(Self::new(config, connector, seeder, Arc::new(EventBus::new())))
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    // -------------------------------------------------------------------------
    // Subscribe
    // -------------------------------------------------------------------------

    fn subscribe_feed(&self, channel: FeedChannel, symbol: &str) {
        let market = format_market(symbol);
        let streams = self.inner.streams.read().clone();
        if let Some(owner) = streams
            .iter()
            .find(|m| m.has_feed_subscription(channel, &market) || m.has_pending_retry(channel, &market))
        {
            owner.subscribe_feed(channel, &market, false);
            return;
        }

        let manager = self.inner.select_manager(&self.inner.streams, |_| 1);
        manager.subscribe_feed(channel, &market, false);
    }

    pub fn subscribe_ticker(&self, symbol: &str) {
        self.subscribe_feed(FeedChannel::Ticker, symbol);
    }

    pub fn subscribe_tickers<S: AsRef<str>>(&self, symbols: &[S]) {
        for symbol in symbols {
            self.subscribe_ticker(symbol.as_ref());
        }
    }

    pub fn subscribe_trades(&self, symbol: &str) {
        self.subscribe_feed(FeedChannel::Trades, symbol);
    }

    /// Subscribe to candles. `interval` must be one of
    /// [`CandleInterval::ALL`] in its string form (`15s`, `1m`, ...).
    pub fn subscribe_candle(&self, symbol: &str, interval: &str) -> Result<(), FeedError> {
        let interval: CandleInterval = interval.parse()?;
        let market = format_market(symbol);

        let candles = self.inner.candles.read().clone();
        if candles.iter().any(|m| m.has_candle_subscription(&market, interval)) {
            return Ok(());
        }

        let manager = self
            .inner
            .select_manager(&self.inner.candles, |m| m.candle_slots_needed(&market));
        manager.subscribe_candle(&market, interval);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Unsubscribe
    // -------------------------------------------------------------------------

    fn unsubscribe_feed(&self, channel: FeedChannel, symbol: &str) -> Result<(), FeedError> {
        let market = format_market(symbol);
        let streams = self.inner.streams.read().clone();
        match streams
            .iter()
            .find(|m| m.has_feed_subscription(channel, &market) || m.has_pending_retry(channel, &market))
        {
            Some(owner) => owner.unsubscribe_feed(channel, &market),
            None => Ok(()),
        }
    }

    pub fn unsubscribe_ticker(&self, symbol: &str) -> Result<(), FeedError> {
        self.unsubscribe_feed(FeedChannel::Ticker, symbol)
    }

    /// Unsubscribe every symbol, returning the first failure.
    pub fn unsubscribe_tickers<S: AsRef<str>>(&self, symbols: &[S]) -> Result<(), FeedError> {
        let mut first_error = None;
        for symbol in symbols {
            if let Err(e) = self.unsubscribe_ticker(symbol.as_ref()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn unsubscribe_trades(&self, symbol: &str) -> Result<(), FeedError> {
        self.unsubscribe_feed(FeedChannel::Trades, symbol)
    }

    pub fn unsubscribe_candle(&self, symbol: &str, interval: &str) -> Result<(), FeedError> {
        let interval: CandleInterval = interval.parse()?;
        let market = format_market(symbol);
        let candles = self.inner.candles.read().clone();
        match candles.iter().find(|m| m.has_candle_subscription(&market, interval)) {
            Some(owner) => owner.unsubscribe_candle(&market, interval),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Connection state
    // -------------------------------------------------------------------------

    /// Ask every connection to close; returns the first refusal.
    pub fn close_connection(&self) -> Result<(), FeedError> {
        let mut first_error = None;
        for manager in self.inner.all() {
            if let Err(e) = manager.close_connection() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// `true` when at least one connection is in use and all connections in
    /// use are open. Connections closed on request are not in use.
    pub fn is_socket_open(&self) -> bool {
        let live: Vec<_> = self
            .inner
            .all()
            .into_iter()
            .filter(|m| !m.is_closed_by_request())
            .collect();
        !live.is_empty() && live.iter().all(|m| m.is_socket_open())
    }

    pub fn is_socket_connecting(&self) -> bool {
        self.inner.all().iter().any(|m| m.is_socket_connecting())
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.all().iter().map(|m| m.subscription_count()).sum()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.streams.read().len() + self.inner.candles.read().len()
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        self.sweep.abort();
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("streams", &self.inner.streams.read().len())
            .field("candles", &self.inner.candles.read().len())
            .finish()
    }
}
