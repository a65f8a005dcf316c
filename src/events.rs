// =============================================================================
// Event Bus — topic-keyed publish/subscribe
// =============================================================================
//
// One bus is injected per client for consumers, and each connection owns an
// internal bus that wires parsed trades/tickers into its candle aggregators.
// Handlers run synchronously on the emitting task, so they must be short and
// must not block.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::{Candle, CandleInterval, Subscription, Ticker, Trade};

pub const TOPIC_ERROR: &str = "error";
pub const TOPIC_RECONNECT: &str = "reconnect";
pub const TOPIC_SOCKET_NOT_READY: &str = "socket-not-ready";
pub const TOPIC_SUBSCRIPTIONS: &str = "subscriptions";
pub const TOPIC_RETRY_SUBSCRIPTION: &str = "retry-subscription";
pub const TOPIC_RECONNECT_CANDLE: &str = "reconnect-candle";

pub fn ticker_topic(market: &str) -> String {
    format!("ticker-{market}")
}

pub fn trades_topic(market: &str) -> String {
    format!("trades-{market}")
}

pub fn candle_topic(market: &str, interval: CandleInterval) -> String {
    format!("candle-{market}-{interval}")
}

/// Payload published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum FeedEvent {
    Ticker(Ticker),
    Trades(Vec<Trade>),
    Candle(Candle),
    Error(String),
    Reconnect(String),
    SocketNotReady(String),
    RetrySubscription(String),
    Subscriptions(Vec<Subscription>),
    ReconnectCandle {
        symbol: String,
        interval: CandleInterval,
    },
}

/// Opaque handle returned by [`EventBus::on`]; pass it to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`.
    pub fn on<F>(&self, topic: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut map = self.listeners.write();
        let mut removed = false;
        map.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(hid, _)| *hid != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Forward every event on `topic` into an unbounded channel.
    pub fn channel(&self, topic: impl Into<String>) -> (ListenerId, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(topic, move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Deliver `event` to every handler of `topic`.
    pub fn emit(&self, topic: &str, event: FeedEvent) {
        // Snapshot handlers so they may (un)register listeners themselves.
        let handlers: Vec<Handler> = match self.listeners.read().get(topic) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        trace!(topic, listeners = handlers.len(), "emit");
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.listeners.read().get(topic).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.listeners.read().len())
            .finish()
    }
}
