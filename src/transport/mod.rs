//! Transport seam between the connection manager and the websocket.
//!
//! A [`Connector`] opens one socket and hands back a [`SocketHandle`]: a
//! command sender (frames to write, close requests) and a stream of socket
//! events. Each write is acknowledged through a oneshot so the caller learns
//! about transport-level send failures.

#[cfg(test)]
pub(crate) mod mock;
pub mod websocket;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

pub use websocket::WsConnector;

/// Request to the socket writer.
#[derive(Debug)]
pub enum SocketCommand {
    Send {
        payload: String,
        done: oneshot::Sender<anyhow::Result<()>>,
    },
    Close,
}

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(String),
    Error(String),
    /// Terminal: no further events follow.
    Closed,
}

/// An open socket.
#[derive(Debug)]
pub struct SocketHandle {
    pub commands: mpsc::UnboundedSender<SocketCommand>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `url`. Resolves once the handshake has completed.
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<SocketHandle>>;
}
