//! Presence data model shared by server and clients.

use crate::math::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Identifies an isolated group of participants (a "room").
pub type SessionId = String;

/// Opaque participant identifier, stable for the lifetime of a connection.
pub type ParticipantId = String;

/// Longest accepted session id, participant id or reachability token.
pub const MAX_ID_LEN: usize = 128;

/// Longest accepted display name, in characters.
pub const MAX_NAME_LEN: usize = 64;

/// Control state applied at its latest value, never interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlAxes {
    pub throttle: f32,
    pub steering: f32,
}

impl ControlAxes {
    pub fn new(throttle: f32, steering: f32) -> Self {
        Self { throttle, steering }
    }

    pub fn is_finite(&self) -> bool {
        self.throttle.is_finite() && self.steering.is_finite()
    }
}

/// One state snapshot of a participant.
///
/// `timestamp` comes from the sender's monotonic clock and only orders
/// samples within that sender's own stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSample {
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub controls: ControlAxes,
    pub timestamp: u64,
}

impl PresenceSample {
    /// A stationary sample at `position`.
    pub fn new(position: Vec3, timestamp: u64) -> Self {
        Self {
            position,
            orientation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            controls: ControlAxes::default(),
            timestamp,
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_orientation(mut self, orientation: Quat) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_controls(mut self, controls: ControlAxes) -> Self {
        self.controls = controls;
        self
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.orientation.is_finite()
            && self.velocity.is_finite()
            && self.controls.is_finite()
    }

    /// Fields of `self` that differ from `previous`, or `None` when nothing
    /// changed at all.
    pub fn diff(&self, previous: &PresenceSample) -> Option<PartialSample> {
        if self == previous {
            return None;
        }
        Some(PartialSample {
            position: (self.position != previous.position).then_some(self.position),
            orientation: (self.orientation != previous.orientation).then_some(self.orientation),
            velocity: (self.velocity != previous.velocity).then_some(self.velocity),
            controls: (self.controls != previous.controls).then_some(self.controls),
            timestamp: self.timestamp,
        })
    }
}

/// Delta entry carrying only the fields that changed since the last send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSample {
    pub position: Option<Vec3>,
    pub orientation: Option<Quat>,
    pub velocity: Option<Vec3>,
    pub controls: Option<ControlAxes>,
    pub timestamp: u64,
}

impl PartialSample {
    /// A partial that carries every field of `sample`.
    pub fn full(sample: &PresenceSample) -> Self {
        Self {
            position: Some(sample.position),
            orientation: Some(sample.orientation),
            velocity: Some(sample.velocity),
            controls: Some(sample.controls),
            timestamp: sample.timestamp,
        }
    }

    /// Reconstitutes a full sample on top of the last known one.
    pub fn apply_to(&self, base: &PresenceSample) -> PresenceSample {
        PresenceSample {
            position: self.position.unwrap_or(base.position),
            orientation: self.orientation.unwrap_or(base.orientation),
            velocity: self.velocity.unwrap_or(base.velocity),
            controls: self.controls.unwrap_or(base.controls),
            timestamp: self.timestamp,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.map_or(true, |p| p.is_finite())
            && self.orientation.map_or(true, |q| q.is_finite())
            && self.velocity.map_or(true, |v| v.is_finite())
            && self.controls.map_or(true, |c| c.is_finite())
    }
}

/// The broker's outbound view of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub display_name: Option<String>,
    pub reachability: Option<String>,
    /// Milliseconds since the broker started.
    pub joined_at_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    pub total_connections: u32,
    pub active_count: u32,
}

/// Session and participant ids: 1..=128 chars of `[A-Za-z0-9._-]`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Reachability tokens follow the id alphabet plus `/` separators,
/// without empty segments.
pub fn is_valid_reachability(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_ID_LEN
        && token.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        })
}

pub fn is_valid_name(name: &str) -> bool {
    name.chars().count() <= MAX_NAME_LEN
}
