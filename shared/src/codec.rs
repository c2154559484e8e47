//! Binary wire codec for the primary transport, the discovery broker and
//! alternate-transport payloads.
//!
//! Frames are bincode with varint integers, so every enum discriminator is
//! a single leading byte. Decoding never panics and never returns a
//! partially-applied value: either the whole frame validates or the caller
//! gets a [`DecodeError`] and drops it.

use crate::presence::{
    is_valid_id, is_valid_name, is_valid_reachability, BrokerStats, ParticipantId,
    ParticipantRecord, PartialSample, PresenceSample,
};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Largest frame accepted on any connection.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to encode message: {0}")]
pub struct EncodeError(pub String);

/// Primary transport messages. Variant order is the wire tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// First frame of a connection: who I am and where I start.
    Init {
        id: ParticipantId,
        name: Option<String>,
        sample: PresenceSample,
    },
    /// Subsequent samples from an initialized participant.
    Update { sample: PresenceSample },
    /// Every known participant, sent to one member.
    SyncFull {
        users: BTreeMap<ParticipantId, PresenceSample>,
    },
    /// Only the participants whose sample changed since the last send.
    SyncDelta {
        users: BTreeMap<ParticipantId, PartialSample>,
    },
    ParticipantAdded {
        id: ParticipantId,
        name: Option<String>,
        presence: Option<PresenceSample>,
    },
    ParticipantRemoved { id: ParticipantId },
    Heartbeat { timestamp: u64 },
}

/// Discovery broker messages. Variant order is the wire tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerMessage {
    Join {
        id: ParticipantId,
        display_name: Option<String>,
        reachability: Option<String>,
    },
    Leave { id: ParticipantId },
    Heartbeat { id: ParticipantId },
    BrokerUpdate {
        participants: Vec<ParticipantRecord>,
        stats: BrokerStats,
    },
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

/// A closed union that travels as one frame.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Number of variants; any leading byte at or above this is unknown.
    const VARIANTS: u8;

    /// Schema checks applied after a successful decode.
    fn validate(&self) -> Result<(), DecodeError>;

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        options()
            .serialize(self)
            .map_err(|e| EncodeError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let tag = *bytes.first().ok_or(DecodeError::Empty)?;
        check_len(bytes)?;
        if tag >= Self::VARIANTS {
            return Err(DecodeError::UnknownTag(tag));
        }
        let message: Self = options()
            .deserialize(bytes)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

impl WireMessage for Message {
    const VARIANTS: u8 = 7;

    fn validate(&self) -> Result<(), DecodeError> {
        match self {
            Message::Init { id, name, sample } => {
                check_id(id)?;
                check_name(name.as_deref())?;
                check_sample(sample)
            }
            Message::Update { sample } => check_sample(sample),
            Message::SyncFull { users } => users.iter().try_for_each(|(id, sample)| {
                check_id(id)?;
                check_sample(sample)
            }),
            Message::SyncDelta { users } => users.iter().try_for_each(|(id, partial)| {
                check_id(id)?;
                if partial.is_finite() {
                    Ok(())
                } else {
                    Err(non_finite())
                }
            }),
            Message::ParticipantAdded { id, name, presence } => {
                check_id(id)?;
                check_name(name.as_deref())?;
                presence.as_ref().map_or(Ok(()), check_sample)
            }
            Message::ParticipantRemoved { id } => check_id(id),
            Message::Heartbeat { .. } => Ok(()),
        }
    }
}

impl WireMessage for BrokerMessage {
    const VARIANTS: u8 = 4;

    fn validate(&self) -> Result<(), DecodeError> {
        match self {
            BrokerMessage::Join {
                id,
                display_name,
                reachability,
            } => {
                check_id(id)?;
                check_name(display_name.as_deref())?;
                check_reachability(reachability.as_deref())
            }
            BrokerMessage::Leave { id } | BrokerMessage::Heartbeat { id } => check_id(id),
            BrokerMessage::BrokerUpdate { participants, .. } => {
                participants.iter().try_for_each(|record| {
                    check_id(&record.id)?;
                    check_name(record.display_name.as_deref())?;
                    check_reachability(record.reachability.as_deref())
                })
            }
        }
    }
}

/// Alternate transport payload for one sample.
pub fn encode_sample(sample: &PresenceSample) -> Result<Vec<u8>, EncodeError> {
    options()
        .serialize(sample)
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decodes an alternate transport payload. An empty payload means the
/// publisher had no data and is not an error.
pub fn decode_payload(bytes: &[u8]) -> Result<Option<PresenceSample>, DecodeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    check_len(bytes)?;
    let sample: PresenceSample = options()
        .deserialize(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    check_sample(&sample)?;
    Ok(Some(sample))
}

fn check_len(bytes: &[u8]) -> Result<(), DecodeError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(DecodeError::Oversized {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

fn check_id(id: &str) -> Result<(), DecodeError> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(DecodeError::InvalidField {
            field: "id",
            reason: "must be 1-128 characters of [A-Za-z0-9._-]",
        })
    }
}

fn check_name(name: Option<&str>) -> Result<(), DecodeError> {
    match name {
        Some(name) if !is_valid_name(name) => Err(DecodeError::InvalidField {
            field: "name",
            reason: "longer than 64 characters",
        }),
        _ => Ok(()),
    }
}

fn check_reachability(token: Option<&str>) -> Result<(), DecodeError> {
    match token {
        Some(token) if !is_valid_reachability(token) => Err(DecodeError::InvalidField {
            field: "reachability",
            reason: "must be '/'-separated id segments",
        }),
        _ => Ok(()),
    }
}

fn check_sample(sample: &PresenceSample) -> Result<(), DecodeError> {
    if sample.is_finite() {
        Ok(())
    } else {
        Err(non_finite())
    }
}

fn non_finite() -> DecodeError {
    DecodeError::InvalidField {
        field: "sample",
        reason: "contains a non-finite value",
    }
}
