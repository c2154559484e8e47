//! WebSocket listener and per-connection handlers
//!
//! One listener serves every surface, routed by request path:
//! - `/presence/{session}`: primary transport, feeds the session tick loop
//! - `/broker/{session}`: peer discovery
//! - `/relay/pub/{reachability}` and `/relay/sub/{reachability}`: the
//!   alternate transport's data plane
//!
//! Unknown paths, and subscriptions to tracks nobody publishes, are refused
//! during the handshake with 404.

use crate::broadcaster::{JoinRequest, SampleSlot, SessionHub};
use crate::broker::DiscoveryBroker;
use crate::config::ServerConfig;
use crate::outbound::OutboundQueue;
use crate::relay::RelayHub;
use crate::ConnectionId;
use convoy_shared::presence::{is_valid_id, is_valid_reachability};
use convoy_shared::{BrokerMessage, Message, ParticipantId, SessionId, WireMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Cannot resolve bind address: {0}")]
    Address(String),
}

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Where a connection asked to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Presence(SessionId),
    Broker(SessionId),
    RelayPublish(String),
    RelaySubscribe(String),
}

impl Route {
    pub fn parse(path: &str) -> Option<Route> {
        let path = path.strip_prefix('/')?;
        if let Some(session) = path.strip_prefix("presence/") {
            return is_valid_id(session).then(|| Route::Presence(session.to_string()));
        }
        if let Some(session) = path.strip_prefix("broker/") {
            return is_valid_id(session).then(|| Route::Broker(session.to_string()));
        }
        if let Some(track) = path.strip_prefix("relay/pub/") {
            return is_valid_reachability(track).then(|| Route::RelayPublish(track.to_string()));
        }
        if let Some(track) = path.strip_prefix("relay/sub/") {
            return is_valid_reachability(track)
                .then(|| Route::RelaySubscribe(track.to_string()));
        }
        None
    }
}

struct ServerContext {
    config: ServerConfig,
    hub: SessionHub,
    broker: Arc<Mutex<DiscoveryBroker>>,
    relay: RelayHub,
    next_conn: AtomicU64,
}

/// The presence server: session tick loops, discovery broker and relay
/// behind one WebSocket listener.
#[derive(Clone)]
pub struct PresenceServer {
    context: Arc<ServerContext>,
}

impl PresenceServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = SessionHub::new(config.tick_interval(), config.heartbeat_timeout);
        let relay = RelayHub::new(config.relay_capacity);
        Self {
            context: Arc::new(ServerContext {
                config,
                hub,
                broker: Arc::new(Mutex::new(DiscoveryBroker::new())),
                relay,
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// Binds the configured address and serves until an accept error.
    pub async fn run(&self) -> Result<(), ServerError> {
        let bind_addr = &self.context.config.bind_addr;
        let addr = tokio::net::lookup_host(bind_addr)
            .await?
            .next()
            .ok_or_else(|| ServerError::Address(bind_addr.clone()))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "Presence server listening on {} ({} Hz)",
            listener.local_addr()?,
            self.context.config.tick_rate
        );
        spawn_broker_sweep(
            Arc::downgrade(&self.context.broker),
            self.context.config.heartbeat_timeout,
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {}", addr);

            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, context).await {
                    debug!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }

    pub fn session_count(&self) -> usize {
        self.context.hub.session_count()
    }

    pub fn relay(&self) -> &RelayHub {
        &self.context.relay
    }
}

/// Drops broker participants that missed their heartbeat. Stops once the
/// broker itself is gone.
fn spawn_broker_sweep(broker: Weak<Mutex<DiscoveryBroker>>, timeout: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let Some(broker) = broker.upgrade() else {
                break;
            };
            let expired = broker.lock().expire(Instant::now(), timeout);
            if expired > 0 {
                info!("Broker sweep removed {} silent participants", expired);
            }
        }
    });
}

fn not_found(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ServerContext>,
) -> Result<(), ServerError> {
    let mut route = None;
    let relay = &context.relay;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match Route::parse(request.uri().path()) {
            Some(Route::RelaySubscribe(ref track)) if !relay.has_track(track) => {
                Err(not_found("no publisher for this track"))
            }
            Some(found) => {
                route = Some(found);
                Ok(response)
            }
            None => Err(not_found("unknown route")),
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(route) = route else {
        return Ok(());
    };

    let conn = context.next_conn.fetch_add(1, Ordering::Relaxed);
    debug!("Connection {} from {} routed to {:?}", conn, addr, route);

    match route {
        Route::Presence(session) => handle_presence(ws, session, conn, &context).await,
        Route::Broker(session) => handle_broker(ws, session, conn, &context).await,
        Route::RelayPublish(track) => handle_relay_publish(ws, track, &context.relay).await,
        Route::RelaySubscribe(track) => match context.relay.subscribe(&track) {
            Some(frames) => handle_relay_subscribe(ws, frames).await,
            None => {
                let (mut sink, _) = ws.split();
                let _ = sink.close().await;
            }
        },
    }
    Ok(())
}

/// Drains a connection's queue into its socket until either side closes.
async fn write_frames(mut sink: WsSink, outbound: OutboundQueue) {
    while let Some(frame) = outbound.next().await {
        if sink
            .send(WsMessage::Binary(frame.to_vec().into()))
            .await
            .is_err()
        {
            break;
        }
    }
    outbound.close();
    let _ = sink.close().await;
}

async fn handle_presence(ws: WsStream, session: SessionId, conn: ConnectionId, context: &ServerContext) {
    let (sink, mut stream) = ws.split();
    let outbound = OutboundQueue::new(context.config.outbound_capacity);
    let writer = tokio::spawn(write_frames(sink, outbound.clone()));
    let mut member: Option<(ParticipantId, SampleSlot)> = None;

    while let Some(frame) = stream.next().await {
        let data = match frame {
            Ok(WsMessage::Binary(data)) => data,
            Ok(WsMessage::Close(_)) => break,
            Ok(WsMessage::Text(_)) => {
                warn!("Connection {}: ignoring text frame", conn);
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("Connection {} read error: {}", conn, e);
                break;
            }
        };

        let message = match Message::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Connection {}: dropping malformed frame: {}", conn, e);
                continue;
            }
        };

        match message {
            Message::Init { id, name, sample } => match &member {
                Some((current, slot)) if *current == id => slot.store(sample),
                _ => {
                    if let Some((previous, _)) = member.take() {
                        context.hub.leave(&session, &previous, conn);
                    }
                    let slot = SampleSlot::new(sample);
                    context.hub.join(
                        &session,
                        JoinRequest {
                            id: id.clone(),
                            conn,
                            name,
                            slot: slot.clone(),
                            outbound: outbound.clone(),
                        },
                    );
                    member = Some((id, slot));
                }
            },
            Message::Update { sample } => match &member {
                Some((_, slot)) => slot.store(sample),
                None => warn!("Connection {}: update before init", conn),
            },
            Message::Heartbeat { .. } => {
                if let Some((_, slot)) = &member {
                    slot.touch();
                }
            }
            other => warn!("Connection {}: unexpected {:?}", conn, other),
        }
    }

    if let Some((id, _)) = member {
        context.hub.leave(&session, &id, conn);
    }
    outbound.close();
    let _ = writer.await;
}

async fn handle_broker(ws: WsStream, session: SessionId, conn: ConnectionId, context: &ServerContext) {
    let (sink, mut stream) = ws.split();
    let outbound = OutboundQueue::new(context.config.outbound_capacity);
    context
        .broker
        .lock()
        .connect(&session, conn, outbound.clone());
    let writer = tokio::spawn(write_frames(sink, outbound.clone()));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(data)) => match BrokerMessage::decode(&data) {
                Ok(message) => {
                    context.broker.lock().handle(&session, conn, message);
                }
                Err(e) => warn!("Broker connection {}: dropping malformed frame: {}", conn, e),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Broker connection {} read error: {}", conn, e);
                break;
            }
        }
    }

    context.broker.lock().disconnect(&session, conn);
    outbound.close();
    let _ = writer.await;
}

async fn handle_relay_publish(ws: WsStream, track: String, relay: &RelayHub) {
    let (mut sink, mut stream) = ws.split();
    let mut publisher = relay.publish(&track);
    debug!("Relay track {} published", track);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(data)) => {
                publisher.send(Arc::new(data.to_vec()));
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    publisher.close();
    let _ = sink.close().await;
}

async fn handle_relay_subscribe(ws: WsStream, mut frames: broadcast::Receiver<Arc<Vec<u8>>>) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if sink.send(WsMessage::Binary(frame.to_vec().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Relay subscriber lagged by {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
}
