//! Peer-discovery broker
//!
//! Tracks who is present in each session and how to reach them over the
//! alternate transport, and pushes the membership to every connection of the
//! session whenever it changes. The broker never carries presence payloads.

use crate::outbound::{FrameKind, OutboundQueue};
use crate::registry::SessionRegistry;
use crate::ConnectionId;
use convoy_shared::{
    BrokerMessage, BrokerStats, MonotonicClock, ParticipantId, ParticipantRecord, SessionId,
    WireMessage,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BrokerConnection {
    /// Participant this connection joined as, if any
    participant: Option<ParticipantId>,
    outbound: OutboundQueue,
}

/// Registry plus connections for one session
#[derive(Debug)]
pub struct BrokerSession {
    id: SessionId,
    registry: SessionRegistry,
    connections: HashMap<ConnectionId, BrokerConnection>,
    /// Which connection currently speaks for each participant
    owners: HashMap<ParticipantId, ConnectionId>,
    clock: MonotonicClock,
}

impl BrokerSession {
    pub fn new(id: SessionId, clock: MonotonicClock) -> Self {
        Self {
            id,
            registry: SessionRegistry::new(),
            connections: HashMap::new(),
            owners: HashMap::new(),
            clock,
        }
    }

    /// Registers a connection and answers it with the current membership.
    pub fn connect(&mut self, conn: ConnectionId, outbound: OutboundQueue) {
        let view = self.view_for(None);
        push(&outbound, &view);
        self.connections.insert(
            conn,
            BrokerConnection {
                participant: None,
                outbound,
            },
        );
    }

    /// Idempotent upsert of the participant speaking on `conn`.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        id: &str,
        display_name: Option<String>,
        reachability: Option<String>,
    ) {
        let Some(previous) = self.connections.get(&conn).map(|c| c.participant.clone()) else {
            warn!("Session {}: join from unknown connection {}", self.id, conn);
            return;
        };

        let mut changed = false;
        if let Some(old_id) = previous.filter(|old| old != id) {
            changed |= self.release(&old_id, conn);
        }

        if let Some(old_conn) = self.owners.insert(id.to_string(), conn) {
            if old_conn != conn {
                debug!(
                    "Session {}: {} moved from connection {} to {}",
                    self.id, id, old_conn, conn
                );
                if let Some(old) = self.connections.get_mut(&old_conn) {
                    old.participant = None;
                }
            }
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.participant = Some(id.to_string());
        }

        let before = self
            .registry
            .get(id)
            .map(|p| (p.display_name.clone(), p.reachability.clone()));
        let is_new = self
            .registry
            .upsert(id, display_name.clone(), reachability.clone());
        changed |= is_new || before != Some((display_name, reachability));

        if changed {
            self.broadcast();
        }
    }

    /// Removes a participant if present.
    pub fn leave(&mut self, id: &str) {
        if self.registry.remove(id).is_some() {
            if let Some(conn) = self.owners.remove(id) {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.participant = None;
                }
            }
            self.broadcast();
        }
    }

    /// Refreshes liveness only; nobody is notified.
    pub fn heartbeat(&mut self, id: &str) {
        self.registry.touch(id);
    }

    /// Drops a connection, implicitly leaving the participant it owned.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        connection.outbound.close();
        if let Some(id) = connection.participant {
            if self.release(&id, conn) {
                self.broadcast();
            }
        }
    }

    /// Removes participants not heard from within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        let expired = self.registry.expired(now, timeout);
        for id in &expired {
            info!("Session {}: {} missed its heartbeat", self.id, id);
            self.registry.remove(id);
            if let Some(conn) = self.owners.remove(id) {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.participant = None;
                }
            }
        }
        if !expired.is_empty() {
            self.broadcast();
        }
        expired
    }

    /// Removes `id` if `conn` still owns it.
    fn release(&mut self, id: &str, conn: ConnectionId) -> bool {
        if self.owners.get(id) != Some(&conn) {
            return false;
        }
        self.owners.remove(id);
        self.registry.remove(id).is_some()
    }

    /// All participants, ordered by join time then id
    pub fn snapshot(&self) -> Vec<ParticipantRecord> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|p| p.to_record(&self.clock))
            .collect()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            total_connections: self.connections.len() as u32,
            active_count: self.registry.len() as u32,
        }
    }

    /// Membership as seen by `requester`, which is left out of its own view.
    pub fn view_for(&self, requester: Option<&str>) -> BrokerMessage {
        let participants = self
            .snapshot()
            .into_iter()
            .filter(|record| Some(record.id.as_str()) != requester)
            .collect();
        BrokerMessage::BrokerUpdate {
            participants,
            stats: self.stats(),
        }
    }

    fn broadcast(&self) {
        for connection in self.connections.values() {
            let view = self.view_for(connection.participant.as_deref());
            push(&connection.outbound, &view);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn push(outbound: &OutboundQueue, message: &BrokerMessage) {
    match message.encode() {
        Ok(bytes) => {
            outbound.push(FrameKind::Snapshot, Arc::new(bytes));
        }
        Err(e) => error!("Failed to encode broker update: {}", e),
    }
}

/// All broker sessions. Sessions appear on first connect and are discarded
/// when their last connection closes.
#[derive(Debug, Default)]
pub struct DiscoveryBroker {
    sessions: HashMap<SessionId, BrokerSession>,
    clock: MonotonicClock,
}

impl DiscoveryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, session: &str, conn: ConnectionId, outbound: OutboundQueue) {
        let clock = self.clock;
        self.sessions
            .entry(session.to_string())
            .or_insert_with(|| {
                debug!("Broker session {} created", session);
                BrokerSession::new(session.to_string(), clock)
            })
            .connect(conn, outbound);
    }

    /// Applies one decoded client message.
    pub fn handle(&mut self, session: &str, conn: ConnectionId, message: BrokerMessage) {
        let Some(state) = self.sessions.get_mut(session) else {
            warn!("Broker message for unknown session {}", session);
            return;
        };
        match message {
            BrokerMessage::Join {
                id,
                display_name,
                reachability,
            } => state.join(conn, &id, display_name, reachability),
            BrokerMessage::Leave { id } => state.leave(&id),
            BrokerMessage::Heartbeat { id } => state.heartbeat(&id),
            BrokerMessage::BrokerUpdate { .. } => {
                warn!("Session {}: client sent a broker update, ignoring", session);
            }
        }
    }

    pub fn disconnect(&mut self, session: &str, conn: ConnectionId) {
        let Some(state) = self.sessions.get_mut(session) else {
            return;
        };
        state.disconnect(conn);
        if state.is_empty() {
            self.sessions.remove(session);
            debug!("Broker session {} discarded", session);
        }
    }

    /// Heartbeat sweep across every session.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        self.sessions
            .values_mut()
            .map(|state| state.expire(now, timeout).len())
            .sum()
    }

    pub fn session(&self, session: &str) -> Option<&BrokerSession> {
        self.sessions.get(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
