//! Performance benchmarks for the hot paths of presence synchronization

use convoy_client::{PresenceReconciler, ReconcilerConfig};
use convoy_server::broadcaster::{JoinRequest, PresenceSession, SampleSlot};
use convoy_server::outbound::OutboundQueue;
use convoy_shared::{
    decode_payload, encode_sample, ControlAxes, Message, PresenceSample, Quat, Vec3, WireMessage,
};
use std::collections::BTreeMap;
use std::time::Instant;

fn moving_sample(i: usize, ts: u64) -> PresenceSample {
    let angle = i as f32 * 0.1 + ts as f32 * 0.01;
    PresenceSample::new(Vec3::new(angle.cos() * 20.0, 0.0, angle.sin() * 20.0), ts)
        .with_velocity(Vec3::new(-angle.sin(), 0.0, angle.cos()))
        .with_orientation(Quat::from_yaw(angle))
        .with_controls(ControlAxes::new(1.0, 0.2))
}

/// Benchmarks encoding and decoding a full sync of a busy session
#[test]
fn benchmark_full_sync_codec() {
    let users: BTreeMap<String, PresenceSample> = (0..100)
        .map(|i| (format!("participant-{}", i), moving_sample(i, 1)))
        .collect();
    let message = Message::SyncFull { users };

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert!(matches!(decoded, Message::SyncFull { .. }));
    }

    let duration = start.elapsed();
    println!(
        "Full sync codec (100 users): {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds even unoptimized
    assert!(duration.as_secs() < 5);
}

/// Benchmarks the alternate transport payload path
#[test]
fn benchmark_payload_codec() {
    let sample = moving_sample(7, 42);
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = encode_sample(&sample).unwrap();
        let _ = decode_payload(&bytes).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Payload codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks broadcast ticks for a session where everyone moves every tick
#[test]
fn benchmark_broadcast_tick() {
    let mut session = PresenceSession::new("bench".to_string());
    let slots: Vec<SampleSlot> = (0..50)
        .map(|i| {
            let slot = SampleSlot::new(moving_sample(i, 0));
            session.join(JoinRequest {
                id: format!("p{}", i),
                conn: i as u64,
                name: None,
                slot: slot.clone(),
                outbound: OutboundQueue::new(8),
            });
            slot
        })
        .collect();

    let ticks = 200;
    let start = Instant::now();

    for tick in 1..=ticks {
        for (i, slot) in slots.iter().enumerate() {
            slot.store(moving_sample(i, tick));
        }
        session.tick();
    }

    let duration = start.elapsed();
    println!(
        "Broadcast tick (50 members): {} ticks in {:?} ({:.2} μs/tick)",
        ticks,
        duration,
        duration.as_micros() as f64 / ticks as f64
    );

    assert_eq!(session.ticks(), ticks);
    assert!(duration.as_secs() < 10);
}

/// Benchmarks reconciler ticks with many remote participants
#[test]
fn benchmark_reconciler_tick() {
    let (mut reconciler, _feed) = PresenceReconciler::new(ReconcilerConfig::default());
    for i in 0..1_000 {
        reconciler.apply(&format!("p{}", i), moving_sample(i, 1));
    }

    let frames = 300;
    let start = Instant::now();

    for _ in 0..frames {
        reconciler.tick(1.0 / 60.0);
    }

    let duration = start.elapsed();
    println!(
        "Reconciler tick (1000 participants): {} frames in {:?} ({:.2} μs/frame)",
        frames,
        duration,
        duration.as_micros() as f64 / frames as f64
    );

    assert_eq!(reconciler.len(), 1_000);
    assert!(duration.as_secs() < 5);
}
