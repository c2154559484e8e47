//! Load generator: drives simulated participants against a running server
//! over the primary transport and reports what they received.

use clap::Parser;
use convoy_shared::{ControlAxes, Message, MonotonicClock, PresenceSample, Quat, Vec3, WireMessage};
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// Server base URL
    #[clap(long, default_value = "ws://127.0.0.1:8080")]
    server: String,
    /// Session to join
    #[clap(long, default_value = "lobby")]
    session: String,
    /// Number of simulated participants
    #[clap(short, long, default_value = "8")]
    count: usize,
    /// Samples sent per second by each participant
    #[clap(short, long, default_value = "20")]
    rate: u32,
    /// How long to run, in seconds
    #[clap(short, long, default_value = "10")]
    duration: u64,
}

#[derive(Debug, Default)]
struct BotStats {
    sent: u64,
    full_syncs: u64,
    deltas: u64,
    membership: u64,
}

async fn run_bot(args: Args, index: usize) -> Result<BotStats, Box<dyn std::error::Error + Send + Sync>> {
    let url = format!("{}/presence/{}", args.server, args.session);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    let clock = MonotonicClock::new();
    let id = format!("bot-{}", index);
    let (radius, speed, phase) = {
        let mut rng = rand::thread_rng();
        (
            rng.gen_range(5.0..25.0f32),
            rng.gen_range(0.2..1.5f32),
            rng.gen_range(0.0..std::f32::consts::TAU),
        )
    };
    let sample_at = |t: f32, timestamp: u64| {
        let angle = phase + t * speed;
        PresenceSample::new(Vec3::new(radius * angle.cos(), 0.0, radius * angle.sin()), timestamp)
            .with_velocity(Vec3::new(
                -radius * speed * angle.sin(),
                0.0,
                radius * speed * angle.cos(),
            ))
            .with_orientation(Quat::from_yaw(angle))
            .with_controls(ControlAxes::new(1.0, speed / 1.5))
    };

    let init = Message::Init {
        id: id.clone(),
        name: Some(format!("Bot {}", index)),
        sample: sample_at(0.0, clock.now_millis()),
    };
    sink.send(WsMessage::Binary(init.encode()?.into())).await?;

    let mut stats = BotStats::default();
    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration);
    let mut ticker = interval(Duration::from_micros(1_000_000 / args.rate.max(1) as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,

            _ = ticker.tick() => {
                let t = started.elapsed().as_secs_f32();
                let update = Message::Update { sample: sample_at(t, clock.now_millis()) };
                sink.send(WsMessage::Binary(update.encode()?.into())).await?;
                stats.sent += 1;
            }

            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Binary(data))) => match Message::decode(&data) {
                    Ok(Message::SyncFull { .. }) => stats.full_syncs += 1,
                    Ok(Message::SyncDelta { .. }) => stats.deltas += 1,
                    Ok(Message::ParticipantAdded { .. } | Message::ParticipantRemoved { .. }) => {
                        stats.membership += 1
                    }
                    Ok(_) => {}
                    Err(e) => warn!("{}: bad frame: {}", id, e),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    Ok(stats)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    info!(
        "Starting {} participants in session {} at {} Hz",
        args.count, args.session, args.rate
    );

    let bots: Vec<_> = (0..args.count)
        .map(|index| tokio::spawn(run_bot(args.clone(), index)))
        .collect();

    let mut total = BotStats::default();
    for (index, bot) in bots.into_iter().enumerate() {
        match bot.await? {
            Ok(stats) => {
                info!("bot-{}: {:?}", index, stats);
                total.sent += stats.sent;
                total.full_syncs += stats.full_syncs;
                total.deltas += stats.deltas;
                total.membership += stats.membership;
            }
            Err(e) => warn!("bot-{} failed: {}", index, e),
        }
    }

    info!("Totals: {:?}", total);
    Ok(())
}
