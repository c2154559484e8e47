//! Types shared between the convoy server and its clients: the presence
//! data model, vector math and the wire codec.

pub mod codec;
pub mod math;
pub mod presence;

pub use codec::{
    decode_payload, encode_sample, BrokerMessage, DecodeError, EncodeError, Message, WireMessage,
    MAX_FRAME_LEN,
};
pub use math::{Quat, Vec3};
pub use presence::{
    BrokerStats, ControlAxes, ParticipantId, ParticipantRecord, PartialSample, PresenceSample,
    SessionId,
};

use std::time::Instant;

/// Default presence broadcast rate in Hz.
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Millisecond clock that only moves forward. Sample timestamps are taken
/// from one of these per sender.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Milliseconds between the clock's origin and `instant`, saturating at
    /// zero for instants taken before the clock started.
    pub fn millis_at(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.origin).as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let first = clock.now_millis();
        std::thread::sleep(Duration::from_millis(5));
        let second = clock.now_millis();
        assert!(second >= first + 5);
    }

    #[test]
    fn test_millis_at_saturates() {
        let before = Instant::now();
        let clock = MonotonicClock::new();
        assert_eq!(clock.millis_at(before), 0);
        assert!(clock.millis_at(Instant::now() + Duration::from_millis(20)) >= 20);
    }
}
