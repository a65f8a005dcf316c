// =============================================================================
// Websocket connector on tokio-tungstenite
// =============================================================================
//
// tungstenite never negotiates permessage-deflate, so frames always travel
// uncompressed. The handshake is bounded by `handshake_timeout`.
// =============================================================================

use std::time::Duration;

use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Connector, SocketCommand, SocketEvent, SocketHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<SocketHandle>> {
        let url = url.to_string();
        let handshake_timeout = self.handshake_timeout;

        Box::pin(async move {
            info!(url = %url, "connecting to feed WebSocket");

            let handshake = connect_async_with_config(&url, Some(WebSocketConfig::default()), true);
            let (ws_stream, _response) = tokio::time::timeout(handshake_timeout, handshake)
                .await
                .context("feed WebSocket handshake timed out")?
                .context("failed to connect to feed WebSocket")?;

            info!(url = %url, "feed WebSocket connected");

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (evt_tx, evt_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(ws_stream, cmd_rx, evt_tx));

            Ok(SocketHandle {
                commands: cmd_tx,
                events: evt_rx,
            })
        })
    }
}

/// Shuttle frames between the socket and the manager until either side
/// closes. Always finishes with `SocketEvent::Closed`.
async fn pump(
    ws_stream: WsStream,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Send { payload, done }) => {
                    let res = write
                        .send(Message::Text(payload))
                        .await
                        .context("feed WebSocket send failed");
                    let _ = done.send(res);
                }
                Some(SocketCommand::Close) | None => {
                    debug!("closing feed WebSocket");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Message(text));
                }
                Some(Ok(Message::Close(_))) => {
                    info!("feed WebSocket closed by peer");
                    break;
                }
                // tungstenite answers protocol pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "feed WebSocket read error");
                    let _ = events.send(SocketEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    warn!("feed WebSocket stream ended");
                    break;
                }
            },
        }
    }

    let _ = events.send(SocketEvent::Closed);
}
