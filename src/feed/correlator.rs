// =============================================================================
// Event Correlator — inbound frame dispatch and request/reply matching
// =============================================================================
//
// A pending wait is a one-shot registration keyed by correlation id
// (`subscribed-ticker-BTC/USD`, `pong`, ...) paired with a deadline task.
// Whichever comes first, the matching frame or the deadline, removes the
// registration and resolves it; the other becomes a no-op.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::events::{ticker_topic, trades_topic, EventBus, FeedEvent, TOPIC_ERROR};
use crate::exchange::protocol::{parse_ticker, parse_trades, InboundFrame};
use crate::types::{FeedChannel, Ticker, Trade};

struct PendingWait {
    token: u64,
    resolver: oneshot::Sender<bool>,
    deadline: JoinHandle<()>,
}

/// Resolves to `true` if the awaited frame arrived in time.
#[must_use = "an event wait does nothing unless awaited"]
pub struct EventWait {
    rx: oneshot::Receiver<bool>,
}

impl Future for EventWait {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(false))
    }
}

pub struct EventCorrelator {
    bus: Arc<EventBus>,
    internal: Arc<EventBus>,
    max_wait: Duration,
    pending: Mutex<HashMap<String, PendingWait>>,
    next_token: AtomicU64,
    last_tickers: RwLock<HashMap<String, Ticker>>,
    last_trades: RwLock<HashMap<String, Trade>>,
}

impl EventCorrelator {
    pub fn new(bus: Arc<EventBus>, internal: Arc<EventBus>, max_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            internal,
            max_wait,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            last_tickers: RwLock::new(HashMap::new()),
            last_trades: RwLock::new(HashMap::new()),
        })
    }

    /// Register the single outstanding wait for `key`.
    ///
    /// A wait already outstanding on the same key is superseded and resolves
    /// `false` immediately.
    pub fn wait_for_event(self: &Arc<Self>, key: &str) -> EventWait {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let this = Arc::clone(self);
        let expiring = key.to_string();
        let max_wait = self.max_wait;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(max_wait).await;
            this.expire(&expiring, token);
        });

        let previous = self.pending.lock().insert(
            key.to_string(),
            PendingWait {
                token,
                resolver: tx,
                deadline,
            },
        );
        if let Some(previous) = previous {
            debug!(key, "superseding outstanding wait");
            previous.deadline.abort();
            let _ = previous.resolver.send(false);
        }

        EventWait { rx }
    }

    /// Resolve the wait on `key`, if any. Returns whether one was pending.
    pub fn resolve(&self, key: &str, result: bool) -> bool {
        let Some(wait) = self.pending.lock().remove(key) else {
            return false;
        };
        wait.deadline.abort();
        let _ = wait.resolver.send(result);
        true
    }

    pub fn is_waiting(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    fn expire(&self, key: &str, token: u64) {
        let wait = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(w) if w.token == token => pending.remove(key),
                _ => None,
            }
        };
        if let Some(wait) = wait {
            trace!(key, "wait timed out");
            let _ = wait.resolver.send(false);
        }
    }

    /// Handle one inbound text frame.
    ///
    /// Correlated replies only resolve their wait; they are never also
    /// treated as data.
    pub fn process_message(&self, raw: &str) -> Result<()> {
        let frame = InboundFrame::parse(raw)?;
        let key = frame.correlation_key();

        if self.resolve(&key, true) {
            trace!(key = %key, "correlated reply");
            return Ok(());
        }

        if frame.kind == "error" {
            let msg = frame.msg.clone().unwrap_or_else(|| "unknown exchange error".to_string());
            warn!(error = %msg, "exchange reported an error");
            self.bus.emit(TOPIC_ERROR, FeedEvent::Error(msg));
            return Ok(());
        }

        let (Some(market), Some(data)) = (frame.market.as_deref(), frame.data.as_ref()) else {
            trace!(key = %key, "frame ignored");
            return Ok(());
        };

        if frame.is_update(FeedChannel::Ticker) {
            let ticker = parse_ticker(market, data)?;
            self.last_tickers.write().insert(market.to_string(), ticker.clone());
            let topic = ticker_topic(market);
            self.bus.emit(&topic, FeedEvent::Ticker(ticker.clone()));
            self.internal.emit(&topic, FeedEvent::Ticker(ticker));
        } else if frame.is_update(FeedChannel::Trades) {
            let trades = parse_trades(market, data)?;
            let Some(latest) = trades.iter().max_by_key(|t| t.timestamp).cloned() else {
                return Ok(());
            };
            self.last_trades.write().insert(market.to_string(), latest);
            let topic = trades_topic(market);
            self.bus.emit(&topic, FeedEvent::Trades(trades.clone()));
            self.internal.emit(&topic, FeedEvent::Trades(trades));
        }
        Ok(())
    }

    /// Exchange timestamp of the latest event seen for `market` on `channel`.
    pub fn last_seen(&self, channel: FeedChannel, market: &str) -> Option<i64> {
        match channel {
            FeedChannel::Ticker => self.last_tickers.read().get(market).map(|t| t.timestamp),
            FeedChannel::Trades => self.last_trades.read().get(market).map(|t| t.timestamp),
        }
    }

    pub fn last_ticker(&self, market: &str) -> Option<Ticker> {
        self.last_tickers.read().get(market).cloned()
    }

    pub fn last_trade(&self, market: &str) -> Option<Trade> {
        self.last_trades.read().get(market).cloned()
    }

    /// Drop the cached event for one market.
    pub fn forget(&self, channel: FeedChannel, market: &str) {
        match channel {
            FeedChannel::Ticker => {
                self.last_tickers.write().remove(market);
            }
            FeedChannel::Trades => {
                self.last_trades.write().remove(market);
            }
        }
    }

    pub fn clear_cache(&self) {
        self.last_tickers.write().clear();
        self.last_trades.write().clear();
    }
}
