//! Inbound handling for the primary transport.

use crate::reconciler::ReconcilerFeed;
use convoy_shared::{Message, ParticipantId, PartialSample, PresenceSample};
use log::{debug, warn};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Joined {
        id: ParticipantId,
        name: Option<String>,
    },
    Left {
        id: ParticipantId,
    },
}

/// Last full sample per remote participant, the base that deltas are
/// applied on top of.
#[derive(Debug, Default)]
pub struct PrimaryState {
    local_id: ParticipantId,
    known: HashMap<ParticipantId, PresenceSample>,
    names: HashMap<ParticipantId, Option<String>>,
}

impl PrimaryState {
    pub fn new(local_id: impl Into<ParticipantId>) -> Self {
        Self {
            local_id: local_id.into(),
            ..Default::default()
        }
    }

    pub fn handle(&mut self, message: Message, feed: &ReconcilerFeed) -> Vec<Membership> {
        let mut changes = Vec::new();
        match message {
            Message::SyncFull { users } => {
                let gone: Vec<ParticipantId> = self
                    .names
                    .keys()
                    .filter(|id| !users.contains_key(*id))
                    .cloned()
                    .collect();
                for id in gone {
                    self.forget(&id, feed);
                    changes.push(Membership::Left { id });
                }
                for (id, sample) in users {
                    if id == self.local_id {
                        continue;
                    }
                    if !self.names.contains_key(&id) {
                        self.names.insert(id.clone(), None);
                        changes.push(Membership::Joined {
                            id: id.clone(),
                            name: None,
                        });
                    }
                    self.accept(id, sample, feed);
                }
            }
            Message::SyncDelta { users } => {
                for (id, partial) in users {
                    if id == self.local_id {
                        continue;
                    }
                    match self.rebuild(&id, &partial) {
                        Some(sample) => self.accept(id, sample, feed),
                        None => debug!("Delta for {} without a base, waiting for full sync", id),
                    }
                }
            }
            Message::ParticipantAdded { id, name, presence } => {
                if id == self.local_id {
                    return changes;
                }
                self.names.insert(id.clone(), name.clone());
                if let Some(sample) = presence {
                    self.accept(id.clone(), sample, feed);
                }
                changes.push(Membership::Joined { id, name });
            }
            Message::ParticipantRemoved { id } => {
                if self.names.contains_key(&id) {
                    self.forget(&id, feed);
                    changes.push(Membership::Left { id });
                }
            }
            Message::Heartbeat { .. } => {}
            Message::Init { .. } | Message::Update { .. } => {
                warn!("Ignoring client-only message from server");
            }
        }
        changes
    }

    fn rebuild(&self, id: &str, partial: &PartialSample) -> Option<PresenceSample> {
        if let Some(base) = self.known.get(id) {
            return Some(partial.apply_to(base));
        }
        Some(PresenceSample {
            position: partial.position?,
            orientation: partial.orientation?,
            velocity: partial.velocity?,
            controls: partial.controls?,
            timestamp: partial.timestamp,
        })
    }

    fn accept(&mut self, id: ParticipantId, sample: PresenceSample, feed: &ReconcilerFeed) {
        feed.sample(id.clone(), sample.clone());
        self.names.entry(id.clone()).or_insert(None);
        self.known.insert(id, sample);
    }

    fn forget(&mut self, id: &str, feed: &ReconcilerFeed) {
        self.known.remove(id);
        self.names.remove(id);
        feed.removed(id);
    }

    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.names.get(id).and_then(|name| name.as_deref())
    }

    pub fn participants(&self) -> usize {
        self.names.len()
    }

    /// Forgets everything; the next full sync rebuilds the picture.
    pub fn reset(&mut self) {
        self.known.clear();
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{PresenceReconciler, ReconcilerConfig};
    use convoy_shared::Vec3;
    use std::collections::BTreeMap;

    fn sample(x: f32, ts: u64) -> PresenceSample {
        PresenceSample::new(Vec3::new(x, 0.0, 0.0), ts)
    }

    fn setup() -> (PrimaryState, PresenceReconciler, ReconcilerFeed) {
        let (reconciler, feed) = PresenceReconciler::new(ReconcilerConfig::default());
        (PrimaryState::new("me"), reconciler, feed)
    }

    #[test]
    fn test_full_sync_skips_self() {
        let (mut state, mut reconciler, feed) = setup();
        let users = BTreeMap::from([
            ("me".to_string(), sample(0.0, 1)),
            ("p2".to_string(), sample(2.0, 1)),
        ]);

        let changes = state.handle(Message::SyncFull { users }, &feed);
        assert_eq!(
            changes,
            vec![Membership::Joined {
                id: "p2".to_string(),
                name: None
            }]
        );

        reconciler.pump();
        assert_eq!(reconciler.participants(), vec!["p2".to_string()]);
    }

    #[test]
    fn test_delta_applies_on_known_base() {
        let (mut state, mut reconciler, feed) = setup();
        let users = BTreeMap::from([("p2".to_string(), sample(2.0, 1).with_velocity(Vec3::new(1.0, 0.0, 0.0)))]);
        state.handle(Message::SyncFull { users }, &feed);

        let partial = PartialSample {
            position: Some(Vec3::new(3.0, 0.0, 0.0)),
            orientation: None,
            velocity: None,
            controls: None,
            timestamp: 2,
        };
        let users = BTreeMap::from([("p2".to_string(), partial)]);
        state.handle(Message::SyncDelta { users }, &feed);

        reconciler.pump();
        let entry = reconciler.entry("p2").unwrap();
        assert_eq!(entry.waypoint, Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(entry.velocity, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(entry.origin_timestamp, 2);
    }

    #[test]
    fn test_partial_delta_without_base_is_skipped() {
        let (mut state, mut reconciler, feed) = setup();
        let partial = PartialSample {
            position: Some(Vec3::new(3.0, 0.0, 0.0)),
            orientation: None,
            velocity: None,
            controls: None,
            timestamp: 2,
        };
        state.handle(
            Message::SyncDelta {
                users: BTreeMap::from([("p9".to_string(), partial)]),
            },
            &feed,
        );
        assert_eq!(reconciler.pump(), 0);

        let full = PartialSample::full(&sample(5.0, 3));
        state.handle(
            Message::SyncDelta {
                users: BTreeMap::from([("p9".to_string(), full)]),
            },
            &feed,
        );
        assert_eq!(reconciler.pump(), 1);
        assert!(reconciler.contains("p9"));
    }

    #[test]
    fn test_added_and_removed() {
        let (mut state, mut reconciler, feed) = setup();
        let changes = state.handle(
            Message::ParticipantAdded {
                id: "p2".to_string(),
                name: Some("Bea".to_string()),
                presence: Some(sample(1.0, 1)),
            },
            &feed,
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(state.display_name("p2"), Some("Bea"));
        reconciler.pump();
        assert!(reconciler.contains("p2"));

        let changes = state.handle(
            Message::ParticipantRemoved {
                id: "p2".to_string(),
            },
            &feed,
        );
        assert_eq!(
            changes,
            vec![Membership::Left {
                id: "p2".to_string()
            }]
        );
        reconciler.pump();
        assert!(!reconciler.contains("p2"));

        let changes = state.handle(
            Message::ParticipantRemoved {
                id: "p2".to_string(),
            },
            &feed,
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn test_full_sync_drops_missing() {
        let (mut state, mut reconciler, feed) = setup();
        let users = BTreeMap::from([
            ("p2".to_string(), sample(1.0, 1)),
            ("p3".to_string(), sample(2.0, 1)),
        ]);
        state.handle(Message::SyncFull { users }, &feed);

        let users = BTreeMap::from([("p3".to_string(), sample(2.0, 2))]);
        let changes = state.handle(Message::SyncFull { users }, &feed);
        assert_eq!(
            changes,
            vec![Membership::Left {
                id: "p2".to_string()
            }]
        );

        reconciler.pump();
        assert_eq!(reconciler.participants(), vec!["p3".to_string()]);
        assert_eq!(state.participants(), 1);
    }
}
