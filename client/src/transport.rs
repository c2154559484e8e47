//! Transport abstractions and their WebSocket implementations.
//!
//! [`Transport`] produces framed, bidirectional [`Connection`]s and backs
//! the resilient channels. [`PeerTransport`] opens the per-peer streams of
//! the alternate transport.

use futures_util::{SinkExt, StreamExt};
use log::debug;
use std::future::Future;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not available in this environment")]
    Unsupported,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connect timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("rejected by server: {0}")]
    Rejected(String),
}

impl From<WsError> for TransportError {
    fn from(error: WsError) -> Self {
        match error {
            WsError::Http(response) => TransportError::Rejected(response.status().to_string()),
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(e) => TransportError::Io(e.to_string()),
            other => TransportError::ConnectFailed(other.to_string()),
        }
    }
}

/// One established, message-framed link.
pub trait Connection: Send + 'static {
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound frame; `None` once the link is closed.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Something that can open [`Connection`]s to an endpoint.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    /// Whether this transport can work at all here. Checked once; an
    /// unsupported transport is never retried.
    fn is_supported(&self) -> bool {
        true
    }

    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// Per-peer streams of the alternate transport.
pub trait PeerTransport: Send + Sync + 'static {
    /// Inbound payloads published at `reachability`. The receiver ends when
    /// the remote stream ends.
    fn subscribe(
        &self,
        reachability: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>, TransportError>> + Send;

    /// Outbound stream published at `reachability`. Dropping the sender
    /// closes it.
    fn publish(
        &self,
        reachability: &str,
    ) -> impl Future<Output = Result<mpsc::Sender<Vec<u8>>, TransportError>> + Send;
}

pub struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.ws.send(WsMessage::Binary(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// WebSocket transport. A disabled instance reports itself unsupported.
#[derive(Debug, Clone)]
pub struct WsTransport {
    enabled: bool,
}

impl WsTransport {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WsTransport {
    type Conn = WsConnection;

    fn is_supported(&self) -> bool {
        self.enabled
    }

    async fn connect(&self, endpoint: &str) -> Result<WsConnection, TransportError> {
        if !self.enabled {
            return Err(TransportError::Unsupported);
        }
        let (ws, _) = tokio_tungstenite::connect_async(endpoint).await?;
        Ok(WsConnection { ws })
    }
}

/// Alternate transport over the server's relay endpoints.
#[derive(Debug, Clone)]
pub struct WsPeerTransport {
    base_url: String,
    capacity: usize,
}

impl WsPeerTransport {
    /// `base_url` is the server root, e.g. `ws://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>, capacity: usize) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe_url(&self, reachability: &str) -> String {
        format!("{}/relay/sub/{}", self.base_url, reachability)
    }

    pub fn publish_url(&self, reachability: &str) -> String {
        format!("{}/relay/pub/{}", self.base_url, reachability)
    }
}

impl PeerTransport for WsPeerTransport {
    async fn subscribe(&self, reachability: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut conn = WsTransport::new().connect(&self.subscribe_url(reachability)).await?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let track = reachability.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    frame = conn.recv() => match frame {
                        Some(Ok(bytes)) => {
                            if tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!("Subscription {} failed: {}", track, e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            conn.close().await;
        });

        Ok(rx)
    }

    async fn publish(&self, reachability: &str) -> Result<mpsc::Sender<Vec<u8>>, TransportError> {
        let mut conn = WsTransport::new().connect(&self.publish_url(reachability)).await?;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.capacity);
        let track = reachability.to_string();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = conn.send(frame).await {
                    debug!("Publication {} failed: {}", track, e);
                    break;
                }
            }
            conn.close().await;
        });

        Ok(tx)
    }
}
