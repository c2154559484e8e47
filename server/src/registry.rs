//! Per-session participant registry
//!
//! The registry is the broker's source of truth for who is in a session:
//! - Participant lifecycle (join, heartbeat refresh, leave, expiry)
//! - Stable ordering for snapshots sent to clients
//! - Conversion to the wire-level [`ParticipantRecord`]
//!
//! One registry belongs to exactly one session and is never shared.

use convoy_shared::{MonotonicClock, ParticipantId, ParticipantRecord};
use log::info;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single member of a session
#[derive(Debug, Clone)]
pub struct Participant {
    /// Client-chosen identifier, unique within the session
    pub id: ParticipantId,
    /// Optional human-readable label
    pub display_name: Option<String>,
    /// Address on the alternate transport, if the participant publishes one
    pub reachability: Option<String>,
    /// When the participant first joined
    pub joined_at: Instant,
    /// Last time we heard from this participant
    pub last_seen: Instant,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: Option<String>, reachability: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            display_name,
            reachability,
            joined_at: now,
            last_seen: now,
        }
    }

    /// Marks the participant as alive right now
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing has been heard for longer than `timeout`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    /// Renders monotonic instants relative to the broker clock
    pub fn to_record(&self, clock: &MonotonicClock) -> ParticipantRecord {
        ParticipantRecord {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            reachability: self.reachability.clone(),
            joined_at_ms: clock.millis_at(self.joined_at),
            last_seen_ms: clock.millis_at(self.last_seen),
        }
    }
}

/// Id-keyed set of participants for one session
#[derive(Debug, Default)]
pub struct SessionRegistry {
    participants: HashMap<ParticipantId, Participant>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a participant
    ///
    /// Returns true when the id was not present before. An existing entry
    /// keeps its `joined_at` but takes the new name and reachability, and
    /// its `last_seen` is refreshed either way.
    pub fn upsert(
        &mut self,
        id: &str,
        display_name: Option<String>,
        reachability: Option<String>,
    ) -> bool {
        if let Some(existing) = self.participants.get_mut(id) {
            existing.display_name = display_name;
            existing.reachability = reachability;
            existing.touch();
            return false;
        }

        info!("Participant {} joined", id);
        self.participants.insert(
            id.to_string(),
            Participant::new(id.to_string(), display_name, reachability),
        );
        true
    }

    /// Removes a participant, returning it if it was present
    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        let removed = self.participants.remove(id);
        if removed.is_some() {
            info!("Participant {} left", id);
        }
        removed
    }

    /// Refreshes `last_seen`; false if the id is unknown
    pub fn touch(&mut self, id: &str) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.touch();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    /// All participants ordered by join time, then id
    pub fn snapshot(&self) -> Vec<&Participant> {
        let mut participants: Vec<&Participant> = self.participants.values().collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        participants
    }

    /// Ids whose `last_seen` is older than `timeout` at `now`
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        self.participants
            .values()
            .filter(|p| p.is_expired(now, timeout))
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
