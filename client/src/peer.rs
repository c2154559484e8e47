//! Alternate transport: one subscription per remote participant.
//!
//! The manager mirrors the broker's roster. Every remote participant with a
//! reachability token gets exactly one subscription task, and the local
//! participant publishes its own samples on its token. Subscriptions are
//! only opened while the broker link is ready; until then they are queued.

use crate::reconciler::ReconcilerFeed;
use crate::transport::{PeerTransport, TransportError};
use convoy_shared::{decode_payload, encode_sample, ParticipantId, ParticipantRecord, PresenceSample, SessionId};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRetry {
    /// Delay after the first failure; doubles after each further one
    pub initial: Duration,
    pub max_attempts: u32,
}

impl Default for SubscriptionRetry {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Subscribed { id: ParticipantId },
    /// Every attempt failed; the participant stays known but unsubscribed
    SubscriptionFailed {
        id: ParticipantId,
        error: TransportError,
    },
    StreamEnded { id: ParticipantId },
}

/// Feed handle of one subscription task. Once cancelled it forwards
/// nothing, so a task aborted mid-poll cannot resurrect a participant
/// after its removal was fed.
#[derive(Clone)]
struct SubscriptionGate {
    feed: ReconcilerFeed,
    cancelled: Arc<Mutex<bool>>,
}

impl SubscriptionGate {
    fn new(feed: ReconcilerFeed) -> Self {
        Self {
            feed,
            cancelled: Arc::new(Mutex::new(false)),
        }
    }

    /// Returns false once cancelled. The flag is held across the send, so
    /// nothing is forwarded after `cancel` returns.
    fn forward(&self, id: &str, sample: PresenceSample) -> bool {
        let cancelled = self.cancelled.lock();
        if *cancelled {
            return false;
        }
        self.feed.sample(id, sample);
        true
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
    }
}

struct PeerLink {
    reachability: String,
    task: Option<(JoinHandle<()>, SubscriptionGate)>,
}

impl PeerLink {
    fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|(task, _)| !task.is_finished())
    }

    fn abort(&mut self) {
        if let Some((task, gate)) = self.task.take() {
            gate.cancel();
            task.abort();
        }
    }
}

type PublicationTask = JoinHandle<Result<mpsc::Sender<Vec<u8>>, TransportError>>;

pub struct PeerSessionManager<P: PeerTransport> {
    transport: Arc<P>,
    session: SessionId,
    local_id: ParticipantId,
    local_reachability: String,
    retry: SubscriptionRetry,
    feed: ReconcilerFeed,
    events: mpsc::UnboundedSender<PeerEvent>,
    peers: HashMap<ParticipantId, PeerLink>,
    publication: Option<mpsc::Sender<Vec<u8>>>,
    opening: Option<PublicationTask>,
    ready: bool,
    closed: bool,
}

impl<P: PeerTransport> PeerSessionManager<P> {
    pub fn new(
        transport: P,
        session: impl Into<SessionId>,
        local_id: impl Into<ParticipantId>,
        retry: SubscriptionRetry,
        feed: ReconcilerFeed,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let session = session.into();
        let local_id = local_id.into();
        let local_reachability = Self::reachability_for(&session, &local_id);
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport: Arc::new(transport),
                session,
                local_id,
                local_reachability,
                retry,
                feed,
                events,
                peers: HashMap::new(),
                publication: None,
                opening: None,
                ready: false,
                closed: false,
            },
            event_rx,
        )
    }

    /// Token under which `id` publishes in `session`.
    pub fn reachability_for(session: &str, id: &str) -> String {
        format!("{}/{}", session, id)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn local_reachability(&self) -> &str {
        &self.local_reachability
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Opens queued subscriptions when the broker link comes up; tears
    /// everything down and re-queues it when the link goes away.
    pub fn set_ready(&mut self, ready: bool) {
        if self.closed || ready == self.ready {
            return;
        }
        self.ready = ready;

        if ready {
            let pending: Vec<ParticipantId> = self
                .peers
                .iter()
                .filter(|(_, link)| !link.is_open())
                .map(|(id, _)| id.clone())
                .collect();
            for id in pending {
                self.open(&id);
            }
        } else {
            for link in self.peers.values_mut() {
                link.abort();
            }
            self.drop_publication();
        }
    }

    /// Starts tracking a participant. Unknown reachability means the
    /// participant cannot be subscribed to; a subscription it already had
    /// is stopped.
    pub fn participant_added(&mut self, id: &str, reachability: Option<String>) {
        if self.closed || id == self.local_id {
            return;
        }
        let Some(reachability) = reachability else {
            if let Some(mut link) = self.peers.remove(id) {
                debug!("{} is no longer reachable, unsubscribing", id);
                link.abort();
            } else {
                debug!("{} has no reachability, skipping subscription", id);
            }
            return;
        };
        if reachability == self.local_reachability {
            return;
        }

        if let Some(link) = self.peers.get_mut(id) {
            if link.reachability == reachability {
                if self.ready && !link.is_open() {
                    self.open(id);
                }
                return;
            }
            debug!("{} moved to {}, resubscribing", id, reachability);
            link.abort();
        }

        self.peers.insert(
            id.to_string(),
            PeerLink {
                reachability,
                task: None,
            },
        );
        if self.ready {
            self.open(id);
        }
    }

    /// Stops the participant's subscription, including any pending retry,
    /// and clears its reconciled state.
    pub fn participant_removed(&mut self, id: &str) {
        if let Some(mut link) = self.peers.remove(id) {
            link.abort();
            self.feed.removed(id);
        }
    }

    /// Brings the tracked set in line with a broker roster.
    pub fn sync_roster(&mut self, participants: &[ParticipantRecord]) {
        let present: HashSet<&str> = participants.iter().map(|p| p.id.as_str()).collect();
        let gone: Vec<ParticipantId> = self
            .peers
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            self.participant_removed(&id);
        }
        for record in participants {
            self.participant_added(&record.id, record.reachability.clone());
        }
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.peers.get(id).is_some_and(PeerLink::is_open)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn open(&mut self, id: &str) {
        let Some(reachability) = self.peers.get(id).map(|link| link.reachability.clone()) else {
            return;
        };
        let gate = SubscriptionGate::new(self.feed.clone());
        let task = tokio::spawn(run_subscription(
            self.transport.clone(),
            id.to_string(),
            reachability,
            self.retry,
            gate.clone(),
            self.events.clone(),
        ));
        if let Some(link) = self.peers.get_mut(id) {
            link.task = Some((task, gate));
        }
    }

    /// Starts opening the local publication in the background. Does nothing
    /// if it is already open or an attempt is in flight; the outcome is
    /// collected by [`publication_settled`](Self::publication_settled).
    pub fn begin_publication(&mut self, timeout: Duration) {
        if self.closed || self.has_publication() || self.opening.is_some() {
            return;
        }
        let transport = self.transport.clone();
        let reachability = self.local_reachability.clone();
        self.opening = Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.publish(&reachability)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            }
        }));
    }

    pub fn is_opening_publication(&self) -> bool {
        self.opening.is_some()
    }

    /// Completes when the in-flight publication attempt finishes and stays
    /// pending while there is none. Cancel safe: dropping this future
    /// leaves the attempt running.
    pub async fn publication_settled(&mut self) -> Result<(), TransportError> {
        let Some(task) = self.opening.as_mut() else {
            return std::future::pending().await;
        };
        let joined = task.await;
        self.opening = None;
        match joined {
            Ok(Ok(sender)) => {
                info!("Publishing presence on {}", self.local_reachability);
                self.publication = Some(sender);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Closed),
        }
    }

    fn drop_publication(&mut self) {
        if let Some(task) = self.opening.take() {
            task.abort();
        }
        self.publication = None;
    }

    pub fn has_publication(&self) -> bool {
        self.publication.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Hands a sample to the publication. Returns `false` when there is
    /// none to hand it to.
    pub fn publish(&mut self, sample: &PresenceSample) -> bool {
        let Some(tx) = &self.publication else {
            return false;
        };
        let payload = match encode_sample(sample) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode sample: {}", e);
                return false;
            }
        };
        match tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Publication backlog full, dropping sample");
                true
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Publication on {} closed", self.local_reachability);
                self.publication = None;
                false
            }
        }
    }

    /// Aborts every subscription and the publication. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.ready = false;
        for (_, mut link) in self.peers.drain() {
            link.abort();
        }
        self.drop_publication();
    }
}

impl<P: PeerTransport> Drop for PeerSessionManager<P> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_subscription<P: PeerTransport>(
    transport: Arc<P>,
    id: ParticipantId,
    reachability: String,
    retry: SubscriptionRetry,
    gate: SubscriptionGate,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let mut delay = retry.initial;
    let mut attempt = 1;
    let mut frames = loop {
        match transport.subscribe(&reachability).await {
            Ok(frames) => break frames,
            Err(e) if attempt < retry.max_attempts => {
                warn!(
                    "Subscription to {} failed (attempt {}/{}): {}",
                    reachability, attempt, retry.max_attempts, e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    "Giving up on {} after {} attempts: {}",
                    reachability, attempt, e
                );
                let _ = events.send(PeerEvent::SubscriptionFailed { id, error: e });
                return;
            }
        }
    };

    debug!("Subscribed to {}", reachability);
    let _ = events.send(PeerEvent::Subscribed { id: id.clone() });

    while let Some(payload) = frames.recv().await {
        match decode_payload(&payload) {
            Ok(Some(sample)) => {
                if !gate.forward(&id, sample) {
                    return;
                }
            }
            Ok(None) => debug!("{} published no data", id),
            Err(e) => warn!("Dropping payload from {}: {}", id, e),
        }
    }

    debug!("Stream from {} ended", reachability);
    let _ = events.send(PeerEvent::StreamEnded { id });
}
