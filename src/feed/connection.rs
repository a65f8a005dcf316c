// =============================================================================
// Connection Manager — one websocket, its subscriptions and its lifecycle
// =============================================================================
//
//   Disconnected ──connect()──▶ Connecting ──handshake ok──▶ Open
//        ▲                          │                          │
//        │                    handshake failed           socket closed
//        └──── reconnect after delay (unless a close was requested) ◀┘
//
// Subscription records are added optimistically and rolled back when the
// exchange does not acknowledge them in time. Every socket (re)open bumps the
// connection epoch; acknowledgements that resolve after the epoch moved on
// never touch the records of the current epoch.
//
// All mutable state lives behind one mutex that is never held across an
// `.await`, nor while publishing on the bus or notifying the pool.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::events::{
    EventBus, FeedEvent, TOPIC_ERROR, TOPIC_RECONNECT, TOPIC_RECONNECT_CANDLE,
    TOPIC_RETRY_SUBSCRIPTION, TOPIC_SOCKET_NOT_READY,
};
use crate::exchange::{ack_key, CandleSeeder, OutboundFrame, PONG_KEY};
use crate::feed::command_queue::CommandQueue;
use crate::feed::correlator::EventCorrelator;
use crate::market_data::CandleAggregator;
use crate::runtime_config::{CandleSource, FeedConfig};
use crate::transport::{Connector, SocketCommand, SocketEvent, SocketHandle};
use crate::types::{format_market, CandleInterval, FeedChannel, Subscription, SubscriptionKind};

/// Called after every change to the subscription list.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

const RESTART_KEY: &str = "restart-subscriptions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

struct ManagerState {
    phase: ConnectionPhase,
    socket: Option<mpsc::UnboundedSender<SocketCommand>>,
    epoch: u64,
    asking_close: bool,
    subscriptions: Vec<Subscription>,
    retry_timers: HashMap<String, JoinHandle<()>>,
    /// Retry keys that resubscribe a rolled-back feed on behalf of a candle.
    implied_retries: HashSet<String>,
    last_pong: Option<Instant>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ManagerState {
    fn cancel_retry(&mut self, key: &str) {
        self.implied_retries.remove(key);
        if let Some(timer) = self.retry_timers.remove(key) {
            timer.abort();
        }
    }

    fn cancel_all_retries(&mut self) {
        self.implied_retries.clear();
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
    }

    /// Socket sender if the connection is open and its writer still alive.
    fn ready_socket(&self) -> Option<mpsc::UnboundedSender<SocketCommand>> {
        match (&self.phase, &self.socket) {
            (ConnectionPhase::Open, Some(socket)) if !socket.is_closed() => Some(socket.clone()),
            _ => None,
        }
    }
}

enum Readiness {
    NotOpen,
    NotReady,
    Ready(mpsc::UnboundedSender<SocketCommand>, u64),
}

pub struct ConnectionManager {
    id: Uuid,
    config: Arc<FeedConfig>,
    connector: Arc<dyn Connector>,
    seeder: Arc<dyn CandleSeeder>,
    bus: Arc<EventBus>,
    internal: Arc<EventBus>,
    correlator: Arc<EventCorrelator>,
    queue: CommandQueue,
    on_change: Option<ChangeHook>,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    /// Build a disconnected manager. Spawns the command queue worker, so it
    /// must be called inside a tokio runtime.
    pub fn new(
        config: Arc<FeedConfig>,
        connector: Arc<dyn Connector>,
        seeder: Arc<dyn CandleSeeder>,
        bus: Arc<EventBus>,
        on_change: Option<ChangeHook>,
    ) -> Arc<Self> {
        let internal = Arc::new(EventBus::new());
        let correlator = EventCorrelator::new(bus.clone(), internal.clone(), config.ack_timeout());
        let queue = CommandQueue::start(config.command_timeout());

        Arc::new(Self {
            id: Uuid::new_v4(),
            config,
            connector,
            seeder,
            bus,
            internal,
            correlator,
            queue,
            on_change,
            state: Mutex::new(ManagerState {
                phase: ConnectionPhase::Disconnected,
                socket: None,
                epoch: 0,
                asking_close: false,
                subscriptions: Vec::new(),
                retry_timers: HashMap::new(),
                implied_retries: HashSet::new(),
                last_pong: None,
                heartbeat: None,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn correlator(&self) -> &Arc<EventCorrelator> {
        &self.correlator
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the socket and replay the subscription list.
    ///
    /// A failed handshake is published on `error` and handled like a close.
    pub async fn connect(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if matches!(st.phase, ConnectionPhase::Connecting | ConnectionPhase::Open) {
                debug!(connection = %self.id, phase = ?st.phase, "connect ignored");
                return;
            }
            st.phase = ConnectionPhase::Connecting;
            st.asking_close = false;
            st.last_pong = Some(Instant::now());
        }
        self.correlator.clear_cache();

        info!(connection = %self.id, url = %self.config.ws_url, "connecting");
        match self.connector.connect(&self.config.ws_url).await {
            Ok(handle) => self.on_open(handle),
            Err(e) => {
                warn!(connection = %self.id, error = %e, "connect failed");
                self.bus.emit(TOPIC_ERROR, FeedEvent::Error(format!("{e:#}")));
                let reconnect = {
                    let mut st = self.state.lock();
                    st.phase = ConnectionPhase::Disconnected;
                    st.socket = None;
                    !st.asking_close
                };
                if reconnect {
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn on_open(self: &Arc<Self>, handle: SocketHandle) {
        let SocketHandle { commands, mut events } = handle;

        let (epoch, replay) = {
            let mut st = self.state.lock();
            st.epoch += 1;
            if st.asking_close {
                let _ = commands.send(SocketCommand::Close);
                st.phase = ConnectionPhase::Disconnected;
                return;
            }
            st.socket = Some(commands);
            st.phase = ConnectionPhase::Open;
            st.last_pong = Some(Instant::now());
            (st.epoch, !st.subscriptions.is_empty())
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(mgr) = weak.upgrade() else { return };
                match event {
                    SocketEvent::Message(text) => {
                        if let Err(e) = mgr.correlator.process_message(&text) {
                            warn!(connection = %mgr.id, error = %e, "failed to process frame");
                            mgr.bus.emit(TOPIC_ERROR, FeedEvent::Error(format!("{e:#}")));
                        }
                    }
                    SocketEvent::Error(e) => {
                        warn!(connection = %mgr.id, error = %e, "socket error");
                        mgr.bus.emit(TOPIC_ERROR, FeedEvent::Error(e));
                    }
                    SocketEvent::Closed => break,
                }
            }
            if let Some(mgr) = weak.upgrade() {
                mgr.on_close(epoch);
            }
        });

        let heartbeat = self.start_heartbeat(epoch);
        {
            let mut st = self.state.lock();
            if st.epoch == epoch {
                st.heartbeat = Some(heartbeat);
            } else {
                heartbeat.abort();
                return;
            }
        }

        info!(connection = %self.id, epoch, "socket open");
        if replay {
            self.restart_previous_subscriptions();
        }
    }

    fn on_close(self: &Arc<Self>, epoch: u64) {
        let (reconnect, count) = {
            let mut st = self.state.lock();
            if st.epoch != epoch {
                return;
            }
            st.phase = ConnectionPhase::Disconnected;
            st.socket = None;
            if let Some(heartbeat) = st.heartbeat.take() {
                heartbeat.abort();
            }
            st.epoch += 1;
            (!st.asking_close, st.subscriptions.len())
        };
        self.queue.drain();

        info!(connection = %self.id, subscriptions = count, reconnect, "socket closed");
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.reconnect_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(mgr) = weak.upgrade() else { return };
            if mgr.state.lock().asking_close {
                return;
            }
            let msg = format!(
                "reconnect with {} subscriptions after {}ms",
                mgr.subscription_count(),
                delay.as_millis()
            );
            info!(connection = %mgr.id, "{msg}");
            mgr.bus.emit(TOPIC_RECONNECT, FeedEvent::Reconnect(msg));
            mgr.connect().await;
        });
    }

    /// Clear the list and rebuild it through the normal subscribe path.
    fn restart_previous_subscriptions(self: &Arc<Self>) {
        let previous = {
            let mut guard = self.state.lock();
            if guard.ready_socket().is_none() {
                None
            } else {
                let st = &mut *guard;
                let keys: Vec<String> = st
                    .subscriptions
                    .iter()
                    .filter_map(|sub| sub.channel().map(|channel| ack_key("subscribed", channel, &sub.symbol)))
                    .collect();
                for key in &keys {
                    st.cancel_retry(key);
                }
                st.cancel_retry(RESTART_KEY);
                Some(std::mem::take(&mut st.subscriptions))
            }
        };

        let Some(previous) = previous else {
            warn!(connection = %self.id, "socket not ready, subscriptions will be restarted later");
            self.bus.emit(
                TOPIC_SOCKET_NOT_READY,
                FeedEvent::SocketNotReady("restart subscriptions".to_string()),
            );
            self.schedule_retry(RESTART_KEY.to_string(), self.config.reconnect_delay(), |mgr| {
                mgr.restart_previous_subscriptions();
            });
            return;
        };

        info!(connection = %self.id, count = previous.len(), "restarting subscriptions");
        self.notify_change();
        for sub in previous {
            match sub.kind {
                SubscriptionKind::Ticker { implied_by_candle: true }
                | SubscriptionKind::Trades { implied_by_candle: true } => {}
                SubscriptionKind::Ticker { .. } => self.subscribe_feed(FeedChannel::Ticker, &sub.symbol, false),
                SubscriptionKind::Trades { .. } => self.subscribe_feed(FeedChannel::Trades, &sub.symbol, false),
                SubscriptionKind::Candle { interval, aggregator } => {
                    aggregator.reset();
                    self.subscribe_candle(&sub.symbol, interval);
                }
            }
        }
    }

    /// Close the socket if no subscriptions remain. No reconnect follows.
    pub fn close_connection(&self) -> Result<()> {
        let socket = {
            let mut st = self.state.lock();
            let active = st.subscriptions.len();
            if active > 0 {
                return Err(FeedError::ActiveSubscriptions(active));
            }
            st.asking_close = true;
            st.cancel_all_retries();
            if st.phase == ConnectionPhase::Open {
                st.phase = ConnectionPhase::Closing;
            }
            st.socket.clone()
        };

        info!(connection = %self.id, "closing connection");
        if let Some(socket) = socket {
            let _ = socket.send(SocketCommand::Close);
        }
        Ok(())
    }

    /// Close an open socket without marking the close as requested, so the
    /// normal reconnect path follows.
    pub fn force_close(&self) -> bool {
        let socket = {
            let st = self.state.lock();
            if st.phase != ConnectionPhase::Open {
                return false;
            }
            st.socket.clone()
        };
        warn!(connection = %self.id, "forcing socket close");
        match socket {
            Some(socket) => socket.send(SocketCommand::Close).is_ok(),
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Heartbeat
    // -------------------------------------------------------------------------

    fn start_heartbeat(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.ping_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(mgr) = weak.upgrade() else { return };
                mgr.send_ping(epoch);
            }
        })
    }

    fn send_ping(self: &Arc<Self>, epoch: u64) {
        let socket = {
            let st = self.state.lock();
            if st.epoch != epoch {
                return;
            }
            match st.ready_socket() {
                Some(socket) => socket,
                None => return,
            }
        };

        let wait = self.correlator.wait_for_event(PONG_KEY);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Err(e) = send_frame(&socket, &OutboundFrame::Ping).await {
                debug!(error = %e, "ping not sent");
            }
            let ok = wait.await;
            let Some(mgr) = weak.upgrade() else { return };
            if ok {
                mgr.state.lock().last_pong = Some(Instant::now());
                trace!(connection = %mgr.id, "pong");
            } else {
                debug!(connection = %mgr.id, "pong missed");
            }
        });
    }

    /// `false` once no pong arrived within twice the ping interval.
    pub fn received_pong_recently(&self) -> bool {
        let st = self.state.lock();
        if st.phase == ConnectionPhase::Connecting {
            return true;
        }
        st.last_pong
            .map_or(false, |at| at.elapsed() < self.config.dead_after())
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    fn candle_feed_channel(&self) -> FeedChannel {
        match self.config.candle_source {
            CandleSource::Trades => FeedChannel::Trades,
            CandleSource::Ticker => FeedChannel::Ticker,
        }
    }

    fn readiness(&self) -> Readiness {
        let st = self.state.lock();
        if st.phase != ConnectionPhase::Open || st.socket.is_none() {
            return Readiness::NotOpen;
        }
        match st.ready_socket() {
            Some(socket) => Readiness::Ready(socket, st.epoch),
            None => Readiness::NotReady,
        }
    }

    /// Subscribe to a ticker or trades feed. Idempotent.
    ///
    /// An explicit subscription on a record that only exists for a candle
    /// takes it over, so removing the candle keeps the feed.
    pub fn subscribe_feed(self: &Arc<Self>, channel: FeedChannel, symbol: &str, implied_by_candle: bool) {
        let market = format_market(symbol);
        let key = ack_key("subscribed", channel, &market);
        {
            let mut st = self.state.lock();
            if let Some(existing) = st.subscriptions.iter_mut().find(|s| s.is_feed(channel, &market)) {
                if !implied_by_candle {
                    if let SubscriptionKind::Ticker { implied_by_candle: flag }
                    | SubscriptionKind::Trades { implied_by_candle: flag } = &mut existing.kind
                    {
                        *flag = false;
                    }
                }
                return;
            }
            st.cancel_retry(&key);
            st.subscriptions.push(Subscription::feed(&market, channel, implied_by_candle));
        }
        debug!(connection = %self.id, channel = %channel, market = %market, "subscribe");
        self.notify_change();
        self.attempt_subscribe(channel, market);
    }

    fn attempt_subscribe(self: &Arc<Self>, channel: FeedChannel, market: String) {
        let key = ack_key("subscribed", channel, &market);
        let (socket, epoch) = match self.readiness() {
            Readiness::Ready(socket, epoch) => (socket, epoch),
            Readiness::NotOpen => {
                debug!(connection = %self.id, market = %market, "socket not open, retrying subscribe");
                self.schedule_retry(key, self.config.subscribe_retry(), move |mgr| {
                    mgr.attempt_subscribe(channel, market);
                });
                return;
            }
            Readiness::NotReady => {
                warn!(connection = %self.id, market = %market, "socket not ready");
                self.bus.emit(TOPIC_SOCKET_NOT_READY, FeedEvent::SocketNotReady(market.clone()));
                self.schedule_retry(key, self.config.reconnect_delay(), move |mgr| {
                    mgr.attempt_subscribe(channel, market);
                });
                return;
            }
        };

        let frame = OutboundFrame::Subscribe {
            channel,
            market: market.clone(),
        };
        self.enqueue_request(socket, frame, key, move |mgr, acked| {
            mgr.on_subscribe_reply(acked, epoch, channel, market);
        });
    }

    fn on_subscribe_reply(self: &Arc<Self>, acked: bool, epoch: u64, channel: FeedChannel, market: String) {
        if acked {
            debug!(connection = %self.id, channel = %channel, market = %market, "subscribed");
            return;
        }

        // The record may have been taken over explicitly since the request went out.
        let implied = {
            let mut st = self.state.lock();
            if st.epoch != epoch {
                trace!(connection = %self.id, market = %market, "ignoring reply from an older connection");
                return;
            }
            let Some(pos) = st.subscriptions.iter().position(|s| s.is_feed(channel, &market)) else {
                return;
            };
            st.subscriptions.remove(pos).implied_by_candle()
        };

        warn!(connection = %self.id, channel = %channel, market = %market, "subscribe not acknowledged, retrying");
        self.notify_change();
        let key = ack_key("subscribed", channel, &market);
        self.schedule_retry(key.clone(), self.config.subscribe_retry(), move |mgr| {
            mgr.bus.emit(TOPIC_RETRY_SUBSCRIPTION, FeedEvent::RetrySubscription(market.clone()));
            mgr.subscribe_feed(channel, &market, implied);
        });
        if implied {
            self.state.lock().implied_retries.insert(key);
        }
    }

    /// Unsubscribe from a ticker or trades feed.
    pub fn unsubscribe_feed(self: &Arc<Self>, channel: FeedChannel, symbol: &str) -> Result<()> {
        let market = format_market(symbol);
        let (socket, epoch, removed) = {
            let mut st = self.state.lock();
            if st.phase != ConnectionPhase::Open {
                return Err(FeedError::NotConnected);
            }
            st.cancel_retry(&ack_key("subscribed", channel, &market));
            let Some(pos) = st.subscriptions.iter().position(|s| s.is_feed(channel, &market)) else {
                return Ok(());
            };
            let removed = st.subscriptions.remove(pos);
            (st.socket.clone(), st.epoch, removed)
        };
        debug!(connection = %self.id, channel = %channel, market = %market, "unsubscribe");
        self.notify_change();

        let Some(socket) = socket else {
            return Err(FeedError::NotConnected);
        };
        let frame = OutboundFrame::Unsubscribe {
            channel,
            market: market.clone(),
        };
        let key = ack_key("unsubscribed", channel, &market);
        self.enqueue_request(socket, frame, key, move |mgr, acked| {
            if acked {
                mgr.correlator.forget(channel, &market);
                return;
            }
            let restored = {
                let mut st = mgr.state.lock();
                if st.epoch != epoch || st.subscriptions.iter().any(|s| s.is_feed(channel, &market)) {
                    false
                } else {
                    st.subscriptions.push(removed);
                    true
                }
            };
            if restored {
                warn!(connection = %mgr.id, channel = %channel, market = %market, "unsubscribe not acknowledged, record restored");
                mgr.notify_change();
            }
        });
        Ok(())
    }

    /// Subscribe to `interval` candles for `symbol`. Idempotent.
    pub fn subscribe_candle(self: &Arc<Self>, symbol: &str, interval: CandleInterval) {
        let market = format_market(symbol);
        let aggregator = {
            let mut st = self.state.lock();
            if st.subscriptions.iter().any(|s| s.is_candle(&market, interval)) {
                return;
            }
            let aggregator = CandleAggregator::new(
                &market,
                interval,
                &self.config,
                self.bus.clone(),
                self.internal.clone(),
                self.seeder.clone(),
            );
            st.subscriptions.push(Subscription::candle(&market, interval, aggregator.clone()));
            aggregator
        };
        info!(connection = %self.id, market = %market, interval = %interval, "candle subscribe");
        tokio::spawn(aggregator.launch());

        self.notify_change();
        self.subscribe_feed(self.candle_feed_channel(), &market, true);
    }

    /// Remove a candle subscription. The feed behind it is unsubscribed only
    /// when it was implied and no other candle on the market remains; a
    /// pending resubscribe of that implied feed is cancelled as well.
    pub fn unsubscribe_candle(self: &Arc<Self>, symbol: &str, interval: CandleInterval) -> Result<()> {
        let market = format_market(symbol);
        let channel = self.candle_feed_channel();
        let (removed, drop_feed) = {
            let mut st = self.state.lock();
            if st.phase != ConnectionPhase::Open {
                return Err(FeedError::NotConnected);
            }
            let Some(pos) = st.subscriptions.iter().position(|s| s.is_candle(&market, interval)) else {
                return Ok(());
            };
            let removed = st.subscriptions.remove(pos);
            let other_candles = st
                .subscriptions
                .iter()
                .any(|s| s.symbol == market && matches!(s.kind, SubscriptionKind::Candle { .. }));
            let feed_implied = st
                .subscriptions
                .iter()
                .any(|s| s.is_feed(channel, &market) && s.implied_by_candle());
            let retry_key = ack_key("subscribed", channel, &market);
            if !other_candles && st.implied_retries.contains(&retry_key) {
                debug!(connection = %self.id, market = %market, "cancelling implied feed retry");
                st.cancel_retry(&retry_key);
            }
            (removed, !other_candles && feed_implied)
        };

        if let SubscriptionKind::Candle { aggregator, .. } = &removed.kind {
            aggregator.reset();
        }
        info!(connection = %self.id, market = %market, interval = %interval, "candle unsubscribe");
        self.notify_change();

        if drop_feed {
            self.unsubscribe_feed(channel, &market)?;
        }
        Ok(())
    }

    /// Resubscribe every ticker/trades record whose latest event is older
    /// than the staleness threshold. `now_ms` is wall-clock epoch millis.
    pub fn check_stale_subscriptions(self: &Arc<Self>, now_ms: i64) {
        let records: Vec<(FeedChannel, String, bool, i64)> = {
            let st = self.state.lock();
            if st.phase != ConnectionPhase::Open {
                return;
            }
            st.subscriptions
                .iter()
                .filter_map(|s| {
                    let channel = s.channel()?;
                    Some((channel, s.symbol.clone(), s.implied_by_candle(), s.created_at.timestamp_millis()))
                })
                .collect()
        };

        let stale_after = self.config.stale_after_ms as i64;
        for (channel, market, implied, created_ms) in records {
            let baseline = self
                .correlator
                .last_seen(channel, &market)
                .map_or(created_ms, |seen| seen.max(created_ms));
            if now_ms - baseline < stale_after {
                continue;
            }

            warn!(
                connection = %self.id,
                channel = %channel,
                market = %market,
                silent_ms = now_ms - baseline,
                "stale subscription, resubscribing"
            );
            if let Err(e) = self.unsubscribe_feed(channel, &market) {
                debug!(error = %e, "stale unsubscribe skipped");
            }
            self.subscribe_feed(channel, &market, implied);

            if channel == self.candle_feed_channel() {
                for interval in self.candle_intervals(&market) {
                    self.bus.emit(
                        TOPIC_RECONNECT_CANDLE,
                        FeedEvent::ReconnectCandle {
                            symbol: market.clone(),
                            interval,
                        },
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outbound plumbing
    // -------------------------------------------------------------------------

    /// Queue `frame`. Once it is dequeued the reply wait on `key` is
    /// registered, the frame is written, and `on_reply` runs with the outcome.
    fn enqueue_request<F>(self: &Arc<Self>, socket: mpsc::UnboundedSender<SocketCommand>, frame: OutboundFrame, key: String, on_reply: F)
    where
        F: FnOnce(Arc<Self>, bool) + Send + 'static,
    {
        let this = Arc::clone(self);
        self.queue.push(async move {
            let wait = this.correlator.wait_for_event(&key);
            let weak = Arc::downgrade(&this);
            tokio::spawn(async move {
                let acked = wait.await;
                if let Some(mgr) = weak.upgrade() {
                    on_reply(mgr, acked);
                }
            });

            if let Err(e) = send_frame(&socket, &frame).await {
                warn!(connection = %this.id, key = %key, error = %e, "send failed");
                this.bus.emit(TOPIC_ERROR, FeedEvent::Error(format!("{e:#}")));
                this.correlator.resolve(&key, false);
            }
        });
    }

    fn schedule_retry<F>(self: &Arc<Self>, key: String, delay: Duration, retry: F)
    where
        F: FnOnce(Arc<Self>) + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let own_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(mgr) = weak.upgrade() else { return };
            {
                let mut st = mgr.state.lock();
                st.retry_timers.remove(&own_key);
                st.implied_retries.remove(&own_key);
            }
            retry(mgr);
        });
        let mut st = self.state.lock();
        st.implied_retries.remove(&key);
        if let Some(previous) = st.retry_timers.insert(key, timer) {
            previous.abort();
        }
    }

    fn notify_change(&self) {
        if let Some(hook) = &self.on_change {
            hook();
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    pub fn is_socket_open(&self) -> bool {
        self.phase() == ConnectionPhase::Open
    }

    pub fn is_socket_connecting(&self) -> bool {
        self.phase() == ConnectionPhase::Connecting
    }

    /// `true` after `close_connection` until the next `connect`. No
    /// reconnect happens in this state.
    pub fn is_closed_by_request(&self) -> bool {
        self.state.lock().asking_close
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().subscriptions.clone()
    }

    pub fn has_feed_subscription(&self, channel: FeedChannel, symbol: &str) -> bool {
        let market = format_market(symbol);
        self.state.lock().subscriptions.iter().any(|s| s.is_feed(channel, &market))
    }

    pub fn has_ticker_subscription(&self, symbol: &str) -> bool {
        self.has_feed_subscription(FeedChannel::Ticker, symbol)
    }

    pub fn has_trades_subscription(&self, symbol: &str) -> bool {
        self.has_feed_subscription(FeedChannel::Trades, symbol)
    }

    pub fn has_candle_subscription(&self, symbol: &str, interval: CandleInterval) -> bool {
        let market = format_market(symbol);
        self.state.lock().subscriptions.iter().any(|s| s.is_candle(&market, interval))
    }

    /// Whether a subscribe retry is scheduled for the feed.
    pub fn has_pending_retry(&self, channel: FeedChannel, symbol: &str) -> bool {
        let key = ack_key("subscribed", channel, &format_market(symbol));
        self.state.lock().retry_timers.contains_key(&key)
    }

    /// Slots a candle on `symbol` would take here: the candle record, plus
    /// its feed record when that does not exist yet.
    pub fn candle_slots_needed(&self, symbol: &str) -> usize {
        if self.has_feed_subscription(self.candle_feed_channel(), symbol) {
            1
        } else {
            2
        }
    }

    fn candle_intervals(&self, market: &str) -> Vec<CandleInterval> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.symbol == market)
            .filter_map(|s| match s.kind {
                SubscriptionKind::Candle { interval, .. } => Some(interval),
                _ => None,
            })
            .collect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some(heartbeat) = st.heartbeat.take() {
            heartbeat.abort();
        }
        st.cancel_all_retries();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ConnectionManager")
            .field("id", &self.id)
            .field("phase", &st.phase)
            .field("epoch", &st.epoch)
            .field("subscriptions", &st.subscriptions.len())
            .finish()
    }
}

/// Hand `frame` to the socket writer and wait until it has been written.
async fn send_frame(socket: &mpsc::UnboundedSender<SocketCommand>, frame: &OutboundFrame) -> anyhow::Result<()> {
    let payload = frame.to_json()?;
    let (done, written) = oneshot::channel();
    socket
        .send(SocketCommand::Send { payload, done })
        .map_err(|_| anyhow!("socket writer is closed"))?;
    written.await.context("socket writer dropped the frame")?
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::NoSeed;
    use crate::transport::mock::MockExchange;
    use chrono::Utc;
    use serde_json::json;

    fn manager(config: FeedConfig) -> (Arc<ConnectionManager>, MockExchange, Arc<EventBus>) {
        let mock = MockExchange::new();
        let bus = Arc::new(EventBus::new());
        let mgr = ConnectionManager::new(
            Arc::new(config),
            Arc::new(mock.clone()),
            Arc::new(NoSeed),
            bus.clone(),
            None,
        );
        (mgr, mock, bus)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn connected() -> (Arc<ConnectionManager>, MockExchange, Arc<EventBus>) {
        let (mgr, mock, bus) = manager(FeedConfig::default());
        mgr.connect().await;
        assert!(mgr.is_socket_open());
        (mgr, mock, bus)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_is_idempotent() {
        let (mgr, mock, _) = connected().await;

        mgr.subscribe_feed(FeedChannel::Ticker, "BTC-USD", false);
        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        settle().await;

        assert_eq!(mock.sent_ops("subscribe", "ticker"), vec!["BTC/USD"]);
        assert_eq!(mgr.subscription_count(), 1);
        assert!(mgr.has_ticker_subscription("BTC/USD"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_rolls_back_then_retries() {
        let (mgr, mock, bus) = connected().await;
        let (_id, mut retries) = bus.channel(TOPIC_RETRY_SUBSCRIPTION);
        mock.mute("subscribed-ticker-BTC/USD");

        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        settle().await;
        assert!(mgr.has_ticker_subscription("BTC/USD"));

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert!(!mgr.has_ticker_subscription("BTC/USD"));
        assert!(mgr.has_pending_retry(FeedChannel::Ticker, "BTC/USD"));

        mock.unmute("subscribed-ticker-BTC/USD");
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        assert!(matches!(retries.try_recv(), Ok(FeedEvent::RetrySubscription(m)) if m == "BTC/USD"));
        assert!(mgr.has_ticker_subscription("BTC/USD"));
        assert_eq!(mock.sent_ops("subscribe", "ticker").len(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(mgr.has_ticker_subscription("BTC/USD"));
        assert!(!mgr.has_pending_retry(FeedChannel::Ticker, "BTC/USD"));
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_reports_error_and_rolls_back() {
        let (mgr, mock, bus) = connected().await;
        let (_id, mut errors) = bus.channel(TOPIC_ERROR);
        mock.fail_sends_for("ETH/USD");

        mgr.subscribe_feed(FeedChannel::Trades, "ETH/USD", false);
        settle().await;

        assert!(matches!(errors.try_recv(), Ok(FeedEvent::Error(_))));
        assert!(!mgr.has_trades_subscription("ETH/USD"));
        assert!(mgr.has_pending_retry(FeedChannel::Trades, "ETH/USD"));

        mock.heal_sends_for("ETH/USD");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(mgr.has_trades_subscription("ETH/USD"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_before_connect_retries_until_open() {
        let (mgr, mock, _) = manager(FeedConfig::default());

        mgr.subscribe_feed(FeedChannel::Ticker, "SOL/USD", false);
        assert!(mgr.has_ticker_subscription("SOL/USD"));
        assert!(mgr.has_pending_retry(FeedChannel::Ticker, "SOL/USD"));
        assert_eq!(mgr.unsubscribe_feed(FeedChannel::Ticker, "SOL/USD"), Err(FeedError::NotConnected));

        mgr.connect().await;
        settle().await;
        assert!(!mgr.has_pending_retry(FeedChannel::Ticker, "SOL/USD"));
        assert_eq!(mock.sent_ops("subscribe", "ticker"), vec!["SOL/USD"]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mock.sent_ops("subscribe", "ticker").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_without_ack_restores_record() {
        let (mgr, mock, _) = connected().await;
        mgr.subscribe_candle("BTC/USD", CandleInterval::OneMinute);
        settle().await;
        mock.mute("unsubscribed-trades-BTC/USD");

        mgr.unsubscribe_candle("BTC/USD", CandleInterval::OneMinute).unwrap();
        assert!(!mgr.has_trades_subscription("BTC/USD"));

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        let restored = mgr.subscriptions();
        assert_eq!(restored.len(), 1);
        assert!(restored[0].is_feed(FeedChannel::Trades, "BTC/USD"));
        assert!(restored[0].implied_by_candle());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_ack_forgets_last_seen() {
        let (mgr, mock, _) = connected().await;
        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        settle().await;
        mock.push(json!({
            "type": "update", "channel": "ticker", "market": "BTC/USD",
            "data": { "bid": 1.0, "ask": 2.0, "last": 1.5, "time": 1_700_000_000.0 }
        }));
        settle().await;
        assert!(mgr.correlator().last_seen(FeedChannel::Ticker, "BTC/USD").is_some());

        mgr.unsubscribe_feed(FeedChannel::Ticker, "BTC/USD").unwrap();
        settle().await;
        assert_eq!(mock.sent_ops("unsubscribe", "ticker"), vec!["BTC/USD"]);
        assert!(mgr.correlator().last_seen(FeedChannel::Ticker, "BTC/USD").is_none());
        assert_eq!(mgr.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn candle_unsubscribe_cancels_pending_feed_retry() {
        let (mgr, mock, _) = connected().await;
        mock.mute("subscribed-trades-BTC/USD");
        mgr.subscribe_candle("BTC/USD", CandleInterval::OneMinute);

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert!(!mgr.has_trades_subscription("BTC/USD"));
        assert!(mgr.has_pending_retry(FeedChannel::Trades, "BTC/USD"));

        mock.unmute("subscribed-trades-BTC/USD");
        mgr.unsubscribe_candle("BTC/USD", CandleInterval::OneMinute).unwrap();
        assert!(!mgr.has_pending_retry(FeedChannel::Trades, "BTC/USD"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mgr.subscription_count(), 0);
        assert_eq!(mock.sent_ops("subscribe", "trades"), vec!["BTC/USD"]);
    }

    #[tokio::test(start_paused = true)]
    async fn candle_unsubscribe_keeps_explicit_feed_retry() {
        let (mgr, mock, _) = connected().await;
        mgr.subscribe_candle("BTC/USD", CandleInterval::OneMinute);
        settle().await;
        mock.mute("subscribed-trades-BTC/USD");
        mgr.force_close();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        mgr.subscribe_feed(FeedChannel::Trades, "BTC/USD", false);

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert!(!mgr.has_trades_subscription("BTC/USD"));
        mock.unmute("subscribed-trades-BTC/USD");

        mgr.unsubscribe_candle("BTC/USD", CandleInterval::OneMinute).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let subs = mgr.subscriptions();
        assert_eq!(subs.len(), 1);
        assert!(subs[0].is_feed(FeedChannel::Trades, "BTC/USD"));
        assert!(!subs[0].implied_by_candle());
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_remembered_until_next_connect() {
        let (mgr, _mock, _) = connected().await;
        assert!(!mgr.is_closed_by_request());
        mgr.close_connection().unwrap();
        assert!(mgr.is_closed_by_request());
        settle().await;
        mgr.connect().await;
        assert!(!mgr.is_closed_by_request());
        assert!(mgr.is_socket_open());
    }

    #[tokio::test(start_paused = true)]
    async fn candle_keeps_explicit_feed() {
        let (mgr, mock, _) = connected().await;
        mgr.subscribe_candle("BTC/USD", CandleInterval::OneMinute);
        mgr.subscribe_feed(FeedChannel::Trades, "BTC/USD", false);
        settle().await;
        assert_eq!(mgr.subscription_count(), 2);
        assert_eq!(mgr.candle_slots_needed("BTC/USD"), 1);
        assert_eq!(mgr.candle_slots_needed("ETH/USD"), 2);

        mgr.unsubscribe_candle("BTC/USD", CandleInterval::OneMinute).unwrap();
        settle().await;
        assert!(mgr.has_trades_subscription("BTC/USD"));
        assert!(mock.sent_ops("unsubscribe", "trades").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_symbol_is_cycled_once() {
        let (mgr, mock, bus) = connected().await;
        let (_id, mut candles) = bus.channel(TOPIC_RECONNECT_CANDLE);
        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        mgr.subscribe_candle("ETH/USD", CandleInterval::FiveMinutes);
        settle().await;
        mock.clear_sent();

        mgr.check_stale_subscriptions(now_ms() + 361_000);
        settle().await;

        let mut unsubscribed = mock.sent_ops("unsubscribe", "ticker");
        unsubscribed.extend(mock.sent_ops("unsubscribe", "trades"));
        unsubscribed.sort();
        assert_eq!(unsubscribed, vec!["BTC/USD", "ETH/USD"]);
        assert_eq!(mock.sent_ops("subscribe", "ticker"), vec!["BTC/USD"]);
        assert_eq!(mock.sent_ops("subscribe", "trades"), vec!["ETH/USD"]);
        assert!(matches!(
            candles.try_recv(),
            Ok(FeedEvent::ReconnectCandle { symbol, interval: CandleInterval::FiveMinutes }) if symbol == "ETH/USD"
        ));

        // Fresh records are not stale again.
        mock.clear_sent();
        mgr.check_stale_subscriptions(now_ms() + 1_000);
        settle().await;
        assert!(mock.sent().is_empty());
        assert_eq!(mgr.subscription_count(), 3);
        assert!(mgr.subscriptions().iter().any(|s| s.is_feed(FeedChannel::Trades, "ETH/USD") && s.implied_by_candle()));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_events_are_not_stale() {
        let (mgr, mock, _) = connected().await;
        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        settle().await;
        let later = now_ms() + 400_000;
        mock.push(json!({
            "type": "update", "channel": "ticker", "market": "BTC/USD",
            "data": { "bid": 1.0, "ask": 2.0, "last": 1.5, "time": later as f64 / 1_000.0 }
        }));
        settle().await;
        mock.clear_sent();

        mgr.check_stale_subscriptions(later + 1_000);
        settle().await;
        assert!(mock.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_with_fresh_aggregator() {
        let (mgr, mock, bus) = connected().await;
        let (_id, mut reconnects) = bus.channel(TOPIC_RECONNECT);
        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        mgr.subscribe_feed(FeedChannel::Trades, "ETH/USD", false);
        mgr.subscribe_candle("SOL/USD", CandleInterval::OneMinute);
        settle().await;
        assert_eq!(mgr.subscription_count(), 4);

        let aggregator_of = |subs: &[Subscription]| {
            subs.iter()
                .find_map(|s| match &s.kind {
                    SubscriptionKind::Candle { aggregator, .. } => Some(aggregator.clone()),
                    _ => None,
                })
                .unwrap()
        };
        let old = aggregator_of(&mgr.subscriptions());
        assert!(old.is_attached());

        mock.clear_sent();
        mock.drop_connection();
        settle().await;
        assert!(!mgr.is_socket_open());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(matches!(reconnects.try_recv(), Ok(FeedEvent::Reconnect(m)) if m.contains("4 subscriptions")));
        assert!(mgr.is_socket_open());
        assert_eq!(mock.connects(), 2);

        let subs = mgr.subscriptions();
        assert_eq!(subs.len(), 4);
        let fresh = aggregator_of(&subs);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!old.is_attached());
        assert!(fresh.is_attached());

        let mut trades = mock.sent_ops("subscribe", "trades");
        trades.sort();
        assert_eq!(trades, vec!["ETH/USD", "SOL/USD"]);
        assert_eq!(mock.sent_ops("subscribe", "ticker"), vec!["BTC/USD"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_from_older_epoch_keeps_records() {
        let (mgr, mock, _) = connected().await;
        mock.mute("subscribed-ticker-BTC/USD");
        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        settle().await;

        mock.drop_connection();
        tokio::time::sleep(Duration::from_millis(1_600)).await;

        assert!(mgr.has_ticker_subscription("BTC/USD"));
        assert!(!mgr.has_pending_retry(FeedChannel::Ticker, "BTC/USD"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handshake_reconnects() {
        let (mgr, mock, bus) = manager(FeedConfig::default());
        let (_id, mut errors) = bus.channel(TOPIC_ERROR);
        mock.refuse_next_connects(1);

        mgr.connect().await;
        assert!(!mgr.is_socket_open());
        assert!(matches!(errors.try_recv(), Ok(FeedEvent::Error(_))));

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(mgr.is_socket_open());
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_requires_no_active_subscriptions() {
        let (mgr, mock, _) = connected().await;
        mgr.subscribe_feed(FeedChannel::Ticker, "BTC/USD", false);
        settle().await;
        assert_eq!(mgr.close_connection(), Err(FeedError::ActiveSubscriptions(1)));

        mgr.unsubscribe_feed(FeedChannel::Ticker, "BTC/USD").unwrap();
        settle().await;
        mgr.close_connection().unwrap();
        settle().await;
        assert_eq!(mgr.phase(), ConnectionPhase::Disconnected);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_reconnects() {
        let (mgr, mock, _) = connected().await;
        assert!(mgr.force_close());
        settle().await;
        assert!(!mgr.is_socket_open());
        assert!(!mgr.force_close());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(mgr.is_socket_open());
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pongs_mark_connection_dead() {
        let (mgr, mock, _) = connected().await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(mgr.received_pong_recently());
        assert!(mock.sent().iter().any(|f| f["op"] == "ping"));

        mock.mute("pong");
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!mgr.received_pong_recently());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_trades_feed_candles() {
        let (mgr, mock, bus) = connected().await;
        let topic = crate::events::candle_topic("BTC/USD", CandleInterval::FifteenSeconds);
        let (_id, mut candles) = bus.channel(topic);
        mgr.subscribe_candle("BTC-USD", CandleInterval::FifteenSeconds);
        settle().await;

        mock.push(json!({
            "type": "update", "channel": "trades", "market": "BTC/USD",
            "data": [
                { "id": 1, "price": 10.0, "size": 1.0, "side": "buy", "time": "2021-01-01T00:00:01+00:00" },
                { "id": 2, "price": 12.0, "size": 1.0, "side": "sell", "time": "2021-01-01T00:00:16+00:00" }
            ]
        }));
        settle().await;

        match candles.try_recv() {
            Ok(FeedEvent::Candle(c)) => assert_eq!((c.open, c.close, c.symbol.as_str()), (10.0, 10.0, "BTC/USD")),
            other => panic!("expected candle, got {other:?}"),
        }
    }
}
