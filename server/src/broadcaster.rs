//! Authoritative presence fan-out for the primary transport
//!
//! Each session runs one tick loop that owns the session's membership and
//! per-connection bookkeeping. Connection tasks only ever touch their own
//! [`SampleSlot`]; the tick loop reads every slot once per tick and writes
//! encoded frames to per-connection [`OutboundQueue`]s, so it never waits on
//! the network.

use crate::outbound::{Frame, FrameKind, OutboundQueue};
use crate::ConnectionId;
use convoy_shared::{Message, ParticipantId, PresenceSample, SessionId, WireMessage};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Latest sample written by one connection, read by the tick loop.
///
/// Last write wins; nothing is queued.
#[derive(Debug, Clone)]
pub struct SampleSlot {
    inner: Arc<Mutex<SlotState>>,
}

#[derive(Debug)]
struct SlotState {
    sample: PresenceSample,
    last_seen: Instant,
}

impl SampleSlot {
    pub fn new(sample: PresenceSample) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotState {
                sample,
                last_seen: Instant::now(),
            })),
        }
    }

    pub fn store(&self, sample: PresenceSample) {
        let mut state = self.inner.lock();
        state.sample = sample;
        state.last_seen = Instant::now();
    }

    /// Refreshes liveness without changing the sample
    pub fn touch(&self) {
        self.inner.lock().last_seen = Instant::now();
    }

    pub fn read(&self) -> PresenceSample {
        self.inner.lock().sample.clone()
    }

    pub fn last_seen(&self) -> Instant {
        self.inner.lock().last_seen
    }
}

/// A connection asking to become a session member
#[derive(Debug)]
pub struct JoinRequest {
    pub id: ParticipantId,
    pub conn: ConnectionId,
    pub name: Option<String>,
    pub slot: SampleSlot,
    pub outbound: OutboundQueue,
}

#[derive(Debug)]
pub enum SessionCommand {
    Join(JoinRequest),
    Leave {
        id: ParticipantId,
        conn: ConnectionId,
    },
}

/// Counters for one broadcast tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub full_syncs: usize,
    pub deltas: usize,
    pub dropped: usize,
}

#[derive(Debug)]
struct Member {
    conn: ConnectionId,
    name: Option<String>,
    slot: SampleSlot,
    outbound: OutboundQueue,
    needs_full: bool,
    /// What this connection was last told about each participant
    last_sent: HashMap<ParticipantId, PresenceSample>,
}

/// Membership and per-connection state of one session
#[derive(Debug)]
pub struct PresenceSession {
    id: SessionId,
    members: BTreeMap<ParticipantId, Member>,
    ticks: u64,
}

impl PresenceSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            members: BTreeMap::new(),
            ticks: 0,
        }
    }

    /// Adds a member and announces it to everyone else immediately.
    ///
    /// An id that is already present is taken over by the new connection;
    /// the superseded connection's queue is closed.
    pub fn join(&mut self, request: JoinRequest) {
        let JoinRequest {
            id,
            conn,
            name,
            slot,
            outbound,
        } = request;

        if let Some(previous) = self.members.remove(&id) {
            info!(
                "Session {}: {} reconnected (connection {} replaces {})",
                self.id, id, conn, previous.conn
            );
            previous.outbound.close();
        } else {
            info!("Session {}: {} joined", self.id, id);
            let added = Message::ParticipantAdded {
                id: id.clone(),
                name: name.clone(),
                presence: Some(slot.read()),
            };
            self.send_to_all(&added, FrameKind::Control);
        }

        self.members.insert(
            id,
            Member {
                conn,
                name,
                slot,
                outbound,
                needs_full: true,
                last_sent: HashMap::new(),
            },
        );
    }

    /// Removes a member if `conn` still owns it. Returns whether anything
    /// was removed.
    pub fn leave(&mut self, id: &str, conn: ConnectionId) -> bool {
        match self.members.get(id) {
            Some(member) if member.conn == conn => {
                self.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Removes members whose slot has been silent for longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        let expired: Vec<ParticipantId> = self
            .members
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.slot.last_seen()) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            info!("Session {}: {} timed out", self.id, id);
            self.remove(id);
        }
        expired
    }

    fn remove(&mut self, id: &str) {
        let Some(member) = self.members.remove(id) else {
            return;
        };
        member.outbound.close();
        info!("Session {}: {} left", self.id, id);

        for other in self.members.values_mut() {
            other.last_sent.remove(id);
        }
        let removed = Message::ParticipantRemoved { id: id.to_string() };
        self.send_to_all(&removed, FrameKind::Control);
    }

    /// Runs one broadcast tick: a full sync to every member that needs one,
    /// a delta of changed participants to everyone else.
    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::default();

        let current: BTreeMap<ParticipantId, PresenceSample> = self
            .members
            .iter()
            .map(|(id, member)| (id.clone(), member.slot.read()))
            .collect();
        let mut full_frame: Option<Frame> = None;

        for (member_id, member) in self.members.iter_mut() {
            let needs_full = member.outbound.take_resync() || member.needs_full;

            if needs_full {
                if full_frame.is_none() {
                    full_frame = encode(&Message::SyncFull {
                        users: current.clone(),
                    });
                }
                let Some(frame) = full_frame.clone() else {
                    continue;
                };
                if member.outbound.push(FrameKind::Snapshot, frame) {
                    report.full_syncs += 1;
                } else {
                    report.dropped += 1;
                }
                member.needs_full = false;
                member.last_sent = current.clone().into_iter().collect();
                continue;
            }

            let users: BTreeMap<_, _> = current
                .iter()
                .filter(|(id, _)| *id != member_id)
                .filter_map(|(id, sample)| {
                    let partial = match member.last_sent.get(id) {
                        Some(previous) => sample.diff(previous)?,
                        None => convoy_shared::PartialSample::full(sample),
                    };
                    Some((id.clone(), partial))
                })
                .collect();
            if users.is_empty() {
                continue;
            }

            for id in users.keys() {
                if let Some(sample) = current.get(id) {
                    member.last_sent.insert(id.clone(), sample.clone());
                }
            }
            let Some(frame) = encode(&Message::SyncDelta { users }) else {
                continue;
            };
            if member.outbound.push(FrameKind::Delta, frame) {
                report.deltas += 1;
            } else {
                report.dropped += 1;
            }
        }

        report
    }

    fn send_to_all(&self, message: &Message, kind: FrameKind) {
        let Some(frame) = encode(message) else {
            return;
        };
        for member in self.members.values() {
            member.outbound.push(kind, frame.clone());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.members.get(id).and_then(|m| m.name.as_deref())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

fn encode(message: &Message) -> Option<Frame> {
    match message.encode() {
        Ok(bytes) => Some(Arc::new(bytes)),
        Err(e) => {
            error!("Failed to encode presence frame: {}", e);
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionTiming {
    tick_interval: Duration,
    heartbeat_timeout: Duration,
}

#[derive(Debug)]
struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    generation: u64,
}

#[derive(Debug, Default)]
struct HubState {
    sessions: HashMap<SessionId, SessionHandle>,
    next_generation: u64,
}

/// Routes join/leave commands to per-session tick loops, spawning a loop on
/// first join and letting it exit once the session empties.
#[derive(Debug, Clone)]
pub struct SessionHub {
    state: Arc<Mutex<HubState>>,
    timing: SessionTiming,
}

impl SessionHub {
    pub fn new(tick_interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            timing: SessionTiming {
                tick_interval,
                heartbeat_timeout,
            },
        }
    }

    pub fn join(&self, session: &str, request: JoinRequest) {
        let mut state = self.state.lock();
        let command = SessionCommand::Join(request);

        let command = match state.sessions.get(session) {
            Some(handle) => match handle.commands.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => command,
            },
            None => command,
        };

        state.next_generation += 1;
        let generation = state.next_generation;
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(command).is_err() {
            return;
        }
        state.sessions.insert(
            session.to_string(),
            SessionHandle {
                commands: tx,
                generation,
            },
        );
        debug!("Session {} started", session);
        tokio::spawn(run_session(
            session.to_string(),
            generation,
            rx,
            self.clone(),
        ));
    }

    /// Leaving a session that is not running is a no-op.
    pub fn leave(&self, session: &str, id: &str, conn: ConnectionId) {
        let state = self.state.lock();
        if let Some(handle) = state.sessions.get(session) {
            let _ = handle.commands.send(SessionCommand::Leave {
                id: id.to_string(),
                conn,
            });
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Unregisters a session loop if no command is waiting for it. Sends
    /// happen under the same lock, so nothing can arrive after this returns
    /// true.
    fn retire(
        &self,
        session: &str,
        generation: u64,
        commands: &mpsc::UnboundedReceiver<SessionCommand>,
    ) -> bool {
        let mut state = self.state.lock();
        if !commands.is_empty() {
            return false;
        }
        if state
            .sessions
            .get(session)
            .is_some_and(|handle| handle.generation == generation)
        {
            state.sessions.remove(session);
        }
        true
    }
}

async fn run_session(
    id: SessionId,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    hub: SessionHub,
) {
    let mut session = PresenceSession::new(id.clone());
    let mut ticker = interval(hub.timing.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Join(request)) => session.join(request),
                Some(SessionCommand::Leave { id, conn }) => {
                    session.leave(&id, conn);
                }
                None => break,
            },

            _ = ticker.tick() => {
                session.expire(Instant::now(), hub.timing.heartbeat_timeout);
                let report = session.tick();

                if session.ticks() % 30 == 0 && !session.is_empty() {
                    debug!(
                        "Session {} tick {}: {} members, {} full, {} delta, {} dropped",
                        id,
                        session.ticks(),
                        session.len(),
                        report.full_syncs,
                        report.deltas,
                        report.dropped
                    );
                }
            }
        }

        if session.is_empty() && hub.retire(&id, generation, &commands) {
            break;
        }
    }

    debug!("Session {} closed", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_shared::{PartialSample, Vec3};
    use tokio_test::task;
    use tokio_test::assert_ready;

    fn sample(x: f32, ts: u64) -> PresenceSample {
        PresenceSample::new(Vec3::new(x, 0.0, 0.0), ts)
    }

    fn member(id: &str, conn: ConnectionId, x: f32) -> (JoinRequest, SampleSlot, OutboundQueue) {
        let slot = SampleSlot::new(sample(x, 1));
        let outbound = OutboundQueue::new(16);
        let request = JoinRequest {
            id: id.to_string(),
            conn,
            name: Some(id.to_uppercase()),
            slot: slot.clone(),
            outbound: outbound.clone(),
        };
        (request, slot, outbound)
    }

    fn drain(queue: &OutboundQueue) -> Vec<Message> {
        let mut messages = Vec::new();
        while !queue.is_empty() {
            let mut next = task::spawn(queue.next());
            if let Some(frame) = assert_ready!(next.poll()) {
                messages.push(Message::decode(&frame).unwrap());
            }
        }
        messages
    }

    #[test]
    fn test_first_sync_is_full_with_everyone() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, a_out) = member("a", 1, 1.0);
        let (b, _, _) = member("b", 2, 2.0);
        session.join(a);
        session.join(b);
        session.tick();
        drain(&a_out);

        let (c, _, c_out) = member("c", 3, 3.0);
        session.join(c);
        let report = session.tick();
        assert_eq!(report.full_syncs, 1);

        let messages = drain(&c_out);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::SyncFull { users } => {
                let ids: Vec<&str> = users.keys().map(|k| k.as_str()).collect();
                assert_eq!(ids, vec!["a", "b", "c"]);
                assert_eq!(users["b"].position.x, 2.0);
            }
            other => panic!("expected full sync, got {:?}", other),
        }
    }

    #[test]
    fn test_join_announced_immediately() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, a_out) = member("a", 1, 0.0);
        session.join(a);
        session.tick();
        drain(&a_out);

        let (b, _, b_out) = member("b", 2, 5.0);
        session.join(b);

        let messages = drain(&a_out);
        assert_eq!(
            messages,
            vec![Message::ParticipantAdded {
                id: "b".to_string(),
                name: Some("B".to_string()),
                presence: Some(sample(5.0, 1)),
            }]
        );
        assert!(b_out.is_empty());
        assert_eq!(session.display_name("b"), Some("B"));
    }

    #[test]
    fn test_delta_only_changed_participants() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, a_slot, a_out) = member("a", 1, 0.0);
        let (b, b_slot, b_out) = member("b", 2, 0.0);
        let (c, _, c_out) = member("c", 3, 0.0);
        session.join(a);
        session.join(b);
        session.join(c);
        session.tick();
        drain(&a_out);
        drain(&b_out);
        drain(&c_out);

        b_slot.store(sample(1.0, 2));
        a_slot.store(sample(0.0, 1));
        let report = session.tick();
        assert_eq!(report.full_syncs, 0);
        assert_eq!(report.deltas, 2);

        let expected = Message::SyncDelta {
            users: [(
                "b".to_string(),
                PartialSample {
                    position: Some(Vec3::new(1.0, 0.0, 0.0)),
                    orientation: None,
                    velocity: None,
                    controls: None,
                    timestamp: 2,
                },
            )]
            .into_iter()
            .collect(),
        };
        assert_eq!(drain(&a_out), vec![expected.clone()]);
        assert_eq!(drain(&c_out), vec![expected]);
        assert!(drain(&b_out).is_empty());

        assert_eq!(session.tick(), TickReport::default());
    }

    #[test]
    fn test_last_write_before_tick_wins() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, a_out) = member("a", 1, 0.0);
        let (b, b_slot, _) = member("b", 2, 0.0);
        session.join(a);
        session.join(b);
        session.tick();
        drain(&a_out);

        b_slot.store(sample(1.0, 2));
        b_slot.store(sample(2.0, 3));
        b_slot.store(sample(3.0, 4));
        session.tick();

        match &drain(&a_out)[..] {
            [Message::SyncDelta { users }] => {
                assert_eq!(users["b"].position, Some(Vec3::new(3.0, 0.0, 0.0)));
                assert_eq!(users["b"].timestamp, 4);
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[test]
    fn test_leave_broadcasts_removal() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, a_out) = member("a", 1, 0.0);
        let (b, _, b_out) = member("b", 2, 0.0);
        session.join(a);
        session.join(b);
        session.tick();
        drain(&a_out);

        assert!(!session.leave("b", 99));
        assert!(session.leave("b", 2));
        assert!(b_out.is_closed());
        assert_eq!(
            drain(&a_out),
            vec![Message::ParticipantRemoved {
                id: "b".to_string()
            }]
        );
        assert!(!session.contains("b"));
    }

    #[test]
    fn test_takeover_keeps_member() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, a_out) = member("a", 1, 0.0);
        let (old_b, _, old_b_out) = member("b", 2, 0.0);
        session.join(a);
        session.join(old_b);
        session.tick();
        drain(&a_out);

        let (new_b, _, new_b_out) = member("b", 3, 0.0);
        session.join(new_b);
        assert!(old_b_out.is_closed());
        assert!(drain(&a_out).is_empty());

        assert!(!session.leave("b", 2));
        assert!(session.contains("b"));

        session.tick();
        assert!(matches!(&drain(&new_b_out)[..], [Message::SyncFull { .. }]));
    }

    #[test]
    fn test_saturated_queue_gets_resync() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, _) = member("a", 1, 0.0);
        let (b, b_slot, _) = member("b", 2, 0.0);
        let slow = OutboundQueue::new(2);
        let (mut c, _, _) = member("c", 3, 0.0);
        c.outbound = slow.clone();
        session.join(a);
        session.join(b);
        session.join(c);
        session.tick();

        for step in 0..2 {
            b_slot.store(sample(step as f32 + 1.0, step + 2));
            session.tick();
        }
        assert!(slow.dropped_deltas() > 0);

        b_slot.store(sample(10.0, 20));
        let report = session.tick();
        assert_eq!(report.full_syncs, 1);
    }

    #[test]
    fn test_stalled_member_queue_stays_bounded() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, _) = member("a", 1, 0.0);
        let (b, b_slot, _) = member("b", 2, 0.0);
        let stalled = OutboundQueue::new(2);
        let (mut c, _, _) = member("c", 3, 0.0);
        c.outbound = stalled.clone();
        session.join(a);
        session.join(b);
        session.join(c);

        for step in 0..100u64 {
            b_slot.store(sample(step as f32, step + 2));
            session.tick();
            assert!(stalled.len() <= 2, "queue grew to {}", stalled.len());
        }

        let messages = drain(&stalled);
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::SyncFull { .. })));
    }

    #[test]
    fn test_expire_removes_silent_members() {
        let mut session = PresenceSession::new("lobby".to_string());
        let (a, _, a_out) = member("a", 1, 0.0);
        let (b, b_slot, _) = member("b", 2, 0.0);
        session.join(a);
        session.join(b);
        session.tick();
        drain(&a_out);

        let later = Instant::now() + Duration::from_secs(20);
        b_slot.inner.lock().last_seen = later;
        let expired = session.expire(later, Duration::from_secs(15));

        assert_eq!(expired, vec!["a".to_string()]);
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_hub_recreates_session_after_exit() {
        let hub = SessionHub::new(Duration::from_millis(10), Duration::from_secs(15));
        let (a, _, a_out) = member("a", 1, 0.0);

        hub.join("lobby", a);
        assert_eq!(hub.session_count(), 1);
        let first = tokio::time::timeout(Duration::from_secs(1), a_out.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Message::decode(&first).unwrap(),
            Message::SyncFull { .. }
        ));

        hub.leave("lobby", "a", 1);
        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (a, _, a_out) = member("a", 2, 0.0);
        hub.join("lobby", a);
        let frame = tokio::time::timeout(Duration::from_secs(1), a_out.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Message::decode(&frame).unwrap(),
            Message::SyncFull { .. }
        ));
    }
}
