//! Client-side coordination of both transports.
//!
//! A [`PresenceClient`] keeps a resilient link to the presence endpoint
//! and another to the discovery broker. The broker roster drives the peer
//! subscriptions, and a [`TransportSelector`] decides which transport local
//! samples leave on. Everything inbound ends up in the reconciler feed.

use crate::channel::{ChannelStatus, ConnectionState, ResilientChannel};
use crate::config::ClientConfig;
use crate::peer::{PeerEvent, PeerSessionManager};
use crate::primary::{Membership, PrimaryState};
use crate::reconciler::ReconcilerFeed;
use crate::transport::{PeerTransport, Transport};
use convoy_shared::{
    BrokerMessage, BrokerStats, Message, MonotonicClock, ParticipantRecord, PresenceSample, WireMessage,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTransport {
    Primary,
    Alternate,
}

/// Chooses where outbound samples go. The alternate transport is used
/// only while it is preferred, the broker link is up and the local
/// publication is open; anything else falls back to the primary.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    prefer_alternate: bool,
    active: ActiveTransport,
}

impl TransportSelector {
    pub fn new(prefer_alternate: bool) -> Self {
        Self {
            prefer_alternate,
            active: ActiveTransport::Primary,
        }
    }

    pub fn active(&self) -> ActiveTransport {
        self.active
    }

    /// Returns the new choice when it changed.
    pub fn evaluate(&mut self, broker: ConnectionState, publication_open: bool) -> Option<ActiveTransport> {
        let desired = if self.prefer_alternate && broker == ConnectionState::Connected && publication_open {
            ActiveTransport::Alternate
        } else {
            ActiveTransport::Primary
        };
        if desired == self.active {
            return None;
        }
        self.active = desired;
        Some(desired)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    PrimaryStatus(ChannelStatus),
    BrokerStatus(ChannelStatus),
    TransportSwitched(ActiveTransport),
    Membership(Membership),
    Roster {
        participants: Vec<ParticipantRecord>,
        stats: BrokerStats,
    },
    Peer(PeerEvent),
}

pub struct PresenceClient<P: PeerTransport> {
    config: ClientConfig,
    clock: MonotonicClock,
    primary: ResilientChannel,
    primary_inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    primary_status: Option<watch::Receiver<ChannelStatus>>,
    broker: ResilientChannel,
    broker_inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    broker_status: Option<watch::Receiver<ChannelStatus>>,
    peers: PeerSessionManager<P>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    selector: TransportSelector,
    state: PrimaryState,
    feed: ReconcilerFeed,
    heartbeat_timer: Interval,
    pending: VecDeque<ClientEvent>,
    closed: bool,
}

impl<P: PeerTransport> PresenceClient<P> {
    /// Starts both links and joins the session. Must be called inside a
    /// tokio runtime.
    pub fn connect<T: Transport, B: Transport>(
        config: ClientConfig,
        primary_transport: T,
        broker_transport: B,
        peer_transport: P,
        feed: ReconcilerFeed,
        initial: PresenceSample,
    ) -> Self {
        let (peers, peer_events) = PeerSessionManager::new(
            peer_transport,
            config.session.clone(),
            config.participant_id.clone(),
            config.subscription,
            feed.clone(),
        );

        let (primary, primary_inbound) = ResilientChannel::spawn("primary", primary_transport, config.backoff);
        let (broker, broker_inbound) = ResilientChannel::spawn("broker", broker_transport, config.backoff);

        let join = BrokerMessage::Join {
            id: config.participant_id.clone(),
            display_name: config.display_name.clone(),
            reachability: Some(peers.local_reachability().to_string()),
        };
        broker.set_greeting(frame(&join));
        broker.set_endpoint(config.broker_endpoint());

        let mut heartbeat_timer = tokio::time::interval(config.heartbeat_interval);
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let client = Self {
            clock: MonotonicClock::new(),
            primary_status: Some(primary.subscribe()),
            primary_inbound: Some(primary_inbound),
            primary,
            broker_status: Some(broker.subscribe()),
            broker_inbound: Some(broker_inbound),
            broker,
            peers,
            peer_events,
            selector: TransportSelector::new(config.prefer_alternate),
            state: PrimaryState::new(config.participant_id.clone()),
            feed,
            heartbeat_timer,
            pending: VecDeque::new(),
            closed: false,
            config,
        };
        client.set_primary_greeting(initial);
        client.primary.set_endpoint(client.config.presence_endpoint());

        info!(
            "Joining session {} as {}",
            client.config.session, client.config.participant_id
        );
        client
    }

    fn set_primary_greeting(&self, sample: PresenceSample) {
        let init = Message::Init {
            id: self.config.participant_id.clone(),
            name: self.config.display_name.clone(),
            sample,
        };
        self.primary.set_greeting(frame(&init));
    }

    pub fn local_id(&self) -> &str {
        &self.config.participant_id
    }

    pub fn active_transport(&self) -> ActiveTransport {
        self.selector.active()
    }

    pub fn primary_status(&self) -> ChannelStatus {
        self.primary.status()
    }

    pub fn broker_status(&self) -> ChannelStatus {
        self.broker.status()
    }

    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.state.display_name(id)
    }

    /// Millisecond timestamp for the next local sample.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Sends a local sample on the active transport. Samples that cannot
    /// go out on the alternate transport take the primary one.
    pub fn publish(&mut self, sample: PresenceSample) {
        if self.closed {
            return;
        }
        self.set_primary_greeting(sample.clone());

        if self.selector.active() == ActiveTransport::Alternate {
            if self.peers.publish(&sample) {
                return;
            }
            if let Some(active) = self.selector.evaluate(self.broker.state(), false) {
                warn!("Alternate publication lost, falling back to primary");
                self.pending.push_back(ClientEvent::TransportSwitched(active));
            }
        }

        if let Some(bytes) = frame(&Message::Update { sample }) {
            self.primary.send(bytes);
        }
    }

    /// Liveness frames on both links.
    pub fn heartbeat(&self) {
        let timestamp = self.clock.now_millis();
        if let Some(bytes) = frame(&Message::Heartbeat { timestamp }) {
            self.primary.send(bytes);
        }
        let id = self.config.participant_id.clone();
        if let Some(bytes) = frame(&BrokerMessage::Heartbeat { id }) {
            self.broker.send(bytes);
        }
    }

    /// Drives the client and yields the next thing worth reporting.
    /// Returns `None` after [`close`](Self::close).
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }

            // Every arm is cancel safe, so callers may race this against
            // their own timers.
            tokio::select! {
                bytes = recv_frame(&mut self.primary_inbound) => match bytes {
                    Some(bytes) => self.on_primary_frame(&bytes),
                    None => self.primary_inbound = None,
                },
                bytes = recv_frame(&mut self.broker_inbound) => match bytes {
                    Some(bytes) => self.on_broker_frame(&bytes),
                    None => self.broker_inbound = None,
                },
                status = status_changed(&mut self.primary_status) => match status {
                    Some(status) => self.pending.push_back(ClientEvent::PrimaryStatus(status)),
                    None => self.primary_status = None,
                },
                status = status_changed(&mut self.broker_status) => match status {
                    Some(status) => self.on_broker_status(status),
                    None => self.broker_status = None,
                },
                Some(event) = self.peer_events.recv() => {
                    self.pending.push_back(ClientEvent::Peer(event));
                }
                opened = self.peers.publication_settled() => {
                    if let Err(e) = opened {
                        warn!("Could not open alternate publication: {}", e);
                    }
                    self.evaluate_transport();
                }
                _ = self.heartbeat_timer.tick() => {
                    self.heartbeat();
                    if self.selector.active() == ActiveTransport::Primary {
                        self.select_transport();
                    }
                }
            }
        }
    }

    fn on_primary_frame(&mut self, bytes: &[u8]) {
        match Message::decode(bytes) {
            Ok(message) => {
                for change in self.state.handle(message, &self.feed) {
                    self.pending.push_back(ClientEvent::Membership(change));
                }
            }
            Err(e) => warn!("Dropping malformed presence frame: {}", e),
        }
    }

    fn on_broker_frame(&mut self, bytes: &[u8]) {
        match BrokerMessage::decode(bytes) {
            Ok(BrokerMessage::BrokerUpdate { participants, stats }) => {
                debug!(
                    "Broker roster: {} participants, {} connections",
                    participants.len(),
                    stats.total_connections
                );
                self.peers.sync_roster(&participants);
                self.pending.push_back(ClientEvent::Roster { participants, stats });
            }
            Ok(other) => warn!("Unexpected broker message: {:?}", other),
            Err(e) => warn!("Dropping malformed broker frame: {}", e),
        }
    }

    fn on_broker_status(&mut self, status: ChannelStatus) {
        self.peers.set_ready(status.state == ConnectionState::Connected);
        self.pending.push_back(ClientEvent::BrokerStatus(status));
        self.select_transport();
    }

    /// Starts opening the publication when the alternate transport is
    /// wanted, then re-evaluates. The switch to Alternate happens once the
    /// open settles.
    fn select_transport(&mut self) {
        if self.config.prefer_alternate && self.broker.state() == ConnectionState::Connected {
            self.peers.begin_publication(self.config.backoff.connect_timeout);
        }
        self.evaluate_transport();
    }

    fn evaluate_transport(&mut self) {
        let broker = self.broker.state();
        if let Some(active) = self.selector.evaluate(broker, self.peers.has_publication()) {
            info!("Switched to {:?} transport", active);
            self.pending.push_back(ClientEvent::TransportSwitched(active));
        }
    }

    /// Leaves the broker and shuts every link down. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let id = self.config.participant_id.clone();
        if let Some(bytes) = frame(&BrokerMessage::Leave { id }) {
            self.broker.send(bytes);
        }
        self.primary.close();
        self.broker.close();
        self.peers.close();
        self.state.reset();
        self.pending.clear();
    }
}

fn frame<M: WireMessage>(message: &M) -> Option<Vec<u8>> {
    match message.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode outbound frame: {}", e);
            None
        }
    }
}

async fn recv_frame(rx: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn status_changed(rx: &mut Option<watch::Receiver<ChannelStatus>>) -> Option<ChannelStatus> {
    let Some(status) = rx else {
        return std::future::pending().await;
    };
    status.changed().await.ok()?;
    let current = *status.borrow_and_update();
    Some(current)
}
