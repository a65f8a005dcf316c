//! In-memory exchange used by the tests.
//!
//! Every connection spawns a responder that records outbound frames and, by
//! default, answers subscribe/unsubscribe/ping the way the real feed does.
//! Individual replies can be muted and individual markets can be made to fail
//! at send time.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{Connector, SocketCommand, SocketEvent, SocketHandle};

#[derive(Default)]
struct MockState {
    sent: Vec<Value>,
    connects: usize,
    refuse_connects: usize,
    muted: HashSet<String>,
    failing_markets: HashSet<String>,
    live: Option<mpsc::UnboundedSender<SocketEvent>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockExchange {
    state: Arc<Mutex<MockState>>,
}

impl MockExchange {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stop answering frames whose reply would carry `key`
    /// (e.g. `subscribed-ticker-BTC/USD`, `pong`).
    pub(crate) fn mute(&self, key: &str) {
        self.state.lock().muted.insert(key.to_string());
    }

    pub(crate) fn unmute(&self, key: &str) {
        self.state.lock().muted.remove(key);
    }

    /// Make every write mentioning `market` fail at the transport level.
    pub(crate) fn fail_sends_for(&self, market: &str) {
        self.state.lock().failing_markets.insert(market.to_string());
    }

    pub(crate) fn heal_sends_for(&self, market: &str) {
        self.state.lock().failing_markets.remove(market);
    }

    pub(crate) fn refuse_next_connects(&self, n: usize) {
        self.state.lock().refuse_connects = n;
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub(crate) fn sent(&self) -> Vec<Value> {
        self.state.lock().sent.clone()
    }

    /// Markets of recorded frames with the given `op` and `channel`.
    pub(crate) fn sent_ops(&self, op: &str, channel: &str) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|f| f["op"] == op && f["channel"] == channel)
            .filter_map(|f| f["market"].as_str().map(str::to_string))
            .collect()
    }

    pub(crate) fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Deliver a raw frame on the current connection.
    pub(crate) fn push(&self, raw: Value) {
        if let Some(tx) = self.state.lock().live.as_ref() {
            let _ = tx.send(SocketEvent::Message(raw.to_string()));
        }
    }

    /// Server-side drop of the current connection.
    pub(crate) fn drop_connection(&self) {
        if let Some(tx) = self.state.lock().live.take() {
            let _ = tx.send(SocketEvent::Closed);
        }
    }
}

impl Connector for MockExchange {
    fn connect(&self, _url: &str) -> BoxFuture<'static, anyhow::Result<SocketHandle>> {
        let state = self.state.clone();

        Box::pin(async move {
            let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SocketCommand>();
            let (evt_tx, evt_rx) = mpsc::unbounded_channel();

            {
                let mut s = state.lock();
                if s.refuse_connects > 0 {
                    s.refuse_connects -= 1;
                    anyhow::bail!("connection refused");
                }
                s.connects += 1;
                s.live = Some(evt_tx.clone());
            }

            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    match cmd {
                        SocketCommand::Send { payload, done } => {
                            let frame: Value = serde_json::from_str(&payload).unwrap_or(Value::Null);
                            let (reply, failed) = {
                                let mut s = state.lock();
                                s.sent.push(frame.clone());
                                let failed = frame["market"]
                                    .as_str()
                                    .map_or(false, |m| s.failing_markets.contains(m));
                                let reply = reply_for(&frame)
                                    .filter(|r| !s.muted.contains(&reply_key(r)));
                                (reply, failed)
                            };
                            if failed {
                                let _ = done.send(Err(anyhow::anyhow!("broken pipe")));
                                continue;
                            }
                            let _ = done.send(Ok(()));
                            if let Some(reply) = reply {
                                let _ = evt_tx.send(SocketEvent::Message(reply.to_string()));
                            }
                        }
                        SocketCommand::Close => {
                            let _ = evt_tx.send(SocketEvent::Closed);
                            break;
                        }
                    }
                }
            });

            Ok(SocketHandle {
                commands: cmd_tx,
                events: evt_rx,
            })
        })
    }
}

fn reply_for(frame: &Value) -> Option<Value> {
    match frame["op"].as_str()? {
        "subscribe" => Some(json!({
            "type": "subscribed", "channel": frame["channel"], "market": frame["market"]
        })),
        "unsubscribe" => Some(json!({
            "type": "unsubscribed", "channel": frame["channel"], "market": frame["market"]
        })),
        "ping" => Some(json!({ "type": "pong" })),
        _ => None,
    }
}

fn reply_key(reply: &Value) -> String {
    match (reply["channel"].as_str(), reply["market"].as_str()) {
        (Some(c), Some(m)) => format!("{}-{}-{}", reply["type"].as_str().unwrap_or(""), c, m),
        _ => reply["type"].as_str().unwrap_or("").to_string(),
    }
}
