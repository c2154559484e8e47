//! Client-side presence reconciliation
//!
//! Turns sparse, jittery, possibly reordered snapshots of remote
//! participants into a position that can be queried every render frame:
//! - Each accepted sample becomes a waypoint that is dead-reckoned forward
//!   with the sample's velocity
//! - The displayed position chases the waypoint with exponential smoothing,
//!   so corrections blend in instead of snapping
//! - Orientation and control axes are taken from the latest sample as-is
//!
//! Network tasks never touch the participant map directly. They push
//! [`FeedEvent`]s through a cloneable [`ReconcilerFeed`], and the owner of
//! the reconciler drains them with [`PresenceReconciler::pump`] on its own
//! schedule. Every operation is O(1) per participant and nothing blocks.

use convoy_shared::{ControlAxes, ParticipantId, PresenceSample, Quat, Vec3};
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound on integration steps per entry per tick
const MAX_SUBSTEPS: u32 = 8;

/// Smoothing and expiry tunables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerConfig {
    /// Exponential approach rate per second
    pub smoothing_rate: f32,
    /// Longest single integration step, in seconds
    pub max_step: f32,
    /// Entries without a new waypoint for this long are dropped
    pub stale_after: Duration,
    /// A sample this far behind the current waypoint means the remote
    /// clock restarted; it replaces the entry instead of being discarded
    pub rewind_tolerance: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            // ~100 ms half-life
            smoothing_rate: std::f32::consts::LN_2 / 0.1,
            max_step: 1.0 / 60.0,
            stale_after: Duration::from_secs(10),
            rewind_tolerance: Duration::from_secs(5),
        }
    }
}

/// Reconciled state of one remote participant
#[derive(Debug, Clone)]
pub struct ReconcilerEntry {
    /// Most recent accepted sample
    pub last_sample: PresenceSample,
    /// Timestamp of the sample that produced the current waypoint
    pub origin_timestamp: u64,
    /// Dead-reckoned target position
    pub waypoint: Vec3,
    pub velocity: Vec3,
    /// Position handed to the renderer
    pub smoothed_position: Vec3,
    pub target_orientation: Quat,
    pub controls: ControlAxes,
    /// Seconds of tick time since the last waypoint
    silence: f32,
}

impl ReconcilerEntry {
    fn new(sample: PresenceSample) -> Self {
        Self {
            origin_timestamp: sample.timestamp,
            waypoint: sample.position,
            velocity: sample.velocity,
            smoothed_position: sample.position,
            target_orientation: sample.orientation.normalized(),
            controls: sample.controls,
            last_sample: sample,
            silence: 0.0,
        }
    }

    fn advance(&mut self, dt: f32, rate: f32) {
        self.waypoint += self.velocity * dt;
        let t = (dt * rate).min(1.0);
        self.smoothed_position = self.smoothed_position.lerp(&self.waypoint, t);
    }

    /// Exact solution of chasing a waypoint that moves at constant
    /// velocity, for frames too long to sub-step.
    fn advance_closed_form(&mut self, dt: f32, rate: f32) {
        let gap = self.smoothed_position - self.waypoint;
        self.waypoint += self.velocity * dt;
        if rate <= 0.0 {
            return;
        }
        let lag = self.velocity * (1.0 / rate);
        let decay = (-rate * dt).exp();
        self.smoothed_position = self.waypoint + (gap + lag) * decay - lag;
    }
}

/// What a query returns for one participant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceView {
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub controls: ControlAxes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First sample for this participant
    Created,
    /// Newer sample, waypoint moved
    Advanced,
    /// Same timestamp as the current waypoint
    Duplicate,
    /// Older than the current waypoint; only controls were applied
    Stale,
    /// Far older than the current waypoint; the remote restarted and the
    /// entry was replaced
    Restarted,
    /// Local participant or non-finite values
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Sample {
        id: ParticipantId,
        sample: PresenceSample,
    },
    Removed {
        id: ParticipantId,
    },
}

/// Write side of the reconciler, safe to hand to network tasks.
#[derive(Debug, Clone)]
pub struct ReconcilerFeed {
    tx: mpsc::UnboundedSender<FeedEvent>,
}

impl ReconcilerFeed {
    pub fn sample(&self, id: impl Into<ParticipantId>, sample: PresenceSample) {
        let _ = self.tx.send(FeedEvent::Sample {
            id: id.into(),
            sample,
        });
    }

    pub fn removed(&self, id: impl Into<ParticipantId>) {
        let _ = self.tx.send(FeedEvent::Removed { id: id.into() });
    }
}

pub struct PresenceReconciler {
    entries: HashMap<ParticipantId, ReconcilerEntry>,
    config: ReconcilerConfig,
    local_id: Option<ParticipantId>,
    events: mpsc::UnboundedReceiver<FeedEvent>,
}

impl PresenceReconciler {
    pub fn new(config: ReconcilerConfig) -> (Self, ReconcilerFeed) {
        let (tx, events) = mpsc::unbounded_channel();
        (
            Self {
                entries: HashMap::new(),
                config,
                local_id: None,
                events,
            },
            ReconcilerFeed { tx },
        )
    }

    /// Samples for the local participant are ignored from now on.
    pub fn set_local_id(&mut self, id: impl Into<ParticipantId>) {
        let id = id.into();
        self.entries.remove(&id);
        self.local_id = Some(id);
    }

    pub fn apply(&mut self, id: &str, sample: PresenceSample) -> ApplyOutcome {
        if self.local_id.as_deref() == Some(id) || !sample.is_finite() {
            return ApplyOutcome::Ignored;
        }

        let Some(entry) = self.entries.get_mut(id) else {
            self.entries
                .insert(id.to_string(), ReconcilerEntry::new(sample));
            return ApplyOutcome::Created;
        };

        entry.controls = sample.controls;
        if sample.timestamp == entry.origin_timestamp {
            return ApplyOutcome::Duplicate;
        }
        if sample.timestamp < entry.origin_timestamp {
            let rewind = entry.origin_timestamp - sample.timestamp;
            if rewind > self.config.rewind_tolerance.as_millis() as u64 {
                debug!("Clock of {} went back {} ms, resetting", id, rewind);
                *entry = ReconcilerEntry::new(sample);
                return ApplyOutcome::Restarted;
            }
            return ApplyOutcome::Stale;
        }

        entry.origin_timestamp = sample.timestamp;
        entry.waypoint = sample.position;
        entry.velocity = sample.velocity;
        entry.target_orientation = sample.orientation.normalized();
        entry.silence = 0.0;
        entry.last_sample = sample;
        ApplyOutcome::Advanced
    }

    /// Forgets a participant; later queries return `None`.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Applies everything the feed has queued. Returns how many events
    /// were processed.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                FeedEvent::Sample { id, sample } => {
                    self.apply(&id, sample);
                }
                FeedEvent::Removed { id } => {
                    self.remove(&id);
                }
            }
            processed += 1;
        }
        processed
    }

    /// Advances every entry by `dt` seconds and drops stale ones. Frames
    /// up to `MAX_SUBSTEPS` steps long are integrated in sub-steps of at
    /// most `max_step`; longer ones are solved in closed form.
    pub fn tick(&mut self, dt: f32) -> Vec<ParticipantId> {
        if !dt.is_finite() || dt <= 0.0 {
            return Vec::new();
        }

        let max_step = self.config.max_step.max(f32::EPSILON);
        let steps = (dt / max_step).ceil().max(1.0);
        let rate = self.config.smoothing_rate;
        let stale_after = self.config.stale_after.as_secs_f32();

        let mut stale = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            entry.silence += dt;
            if entry.silence >= stale_after {
                stale.push(id.clone());
                continue;
            }

            if steps <= MAX_SUBSTEPS as f32 {
                let steps = steps as u32;
                let step = dt / steps as f32;
                for _ in 0..steps {
                    entry.advance(step, rate);
                }
            } else {
                entry.advance_closed_form(dt, rate);
            }
        }

        for id in &stale {
            debug!("Dropping stale presence for {}", id);
            self.entries.remove(id);
        }
        stale
    }

    pub fn position(&self, id: &str) -> Option<Vec3> {
        self.entries.get(id).map(|e| e.smoothed_position)
    }

    pub fn orientation(&self, id: &str) -> Option<Quat> {
        self.entries.get(id).map(|e| e.target_orientation)
    }

    pub fn controls(&self, id: &str) -> Option<ControlAxes> {
        self.entries.get(id).map(|e| e.controls)
    }

    pub fn entry(&self, id: &str) -> Option<&ReconcilerEntry> {
        self.entries.get(id)
    }

    pub fn view(&self, id: &str) -> Option<PresenceView> {
        self.entries.get(id).map(|e| PresenceView {
            position: e.smoothed_position,
            orientation: e.target_orientation,
            velocity: e.velocity,
            controls: e.controls,
        })
    }

    /// Known participant ids in sorted order
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
