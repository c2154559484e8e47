use clap::Parser;
use convoy_client::{
    ClientConfig, ClientEvent, PresenceClient, PresenceReconciler, ReconcilerConfig, WsPeerTransport,
    WsTransport,
};
use convoy_shared::{ControlAxes, PresenceSample, Quat, Vec3};
use log::info;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server base URL
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Session to join
    #[arg(long, default_value = "lobby")]
    session: String,

    /// Display name shown to other participants
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Participant id (random if omitted)
    #[arg(long)]
    id: Option<String>,

    /// Publish samples over peer streams when the broker is reachable
    #[arg(long)]
    prefer_peer: bool,

    /// Do not use the discovery broker at all
    #[arg(long, conflicts_with = "prefer_peer")]
    no_peer: bool,

    /// Samples published per second
    #[arg(short = 'r', long, default_value = "20")]
    publish_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ClientConfig {
        server_url: args.server.clone(),
        session: args.session.clone(),
        display_name: args.name.clone(),
        prefer_alternate: args.prefer_peer,
        ..ClientConfig::default()
    };
    if let Some(id) = args.id.clone() {
        config.participant_id = id;
    }

    info!("Connecting to: {}", config.server_url);
    info!("Session {} as {}", config.session, config.participant_id);

    let (mut reconciler, feed) = PresenceReconciler::new(ReconcilerConfig::default());
    reconciler.set_local_id(config.participant_id.clone());

    let broker = if args.no_peer {
        WsTransport::disabled()
    } else {
        WsTransport::new()
    };
    let peers = WsPeerTransport::new(config.server_url.clone(), 32);
    let mut client = PresenceClient::connect(
        config,
        WsTransport::new(),
        broker,
        peers,
        feed,
        PresenceSample::new(Vec3::ZERO, 0),
    );

    let started = Instant::now();
    let mut publish = interval(Duration::from_micros(1_000_000 / args.publish_rate.max(1) as u64));
    publish.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut render = interval(Duration::from_micros(1_000_000 / 60));
    render.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_frame = Instant::now();
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(ClientEvent::Membership(change)) => info!("{:?}", change),
                Some(ClientEvent::TransportSwitched(active)) => info!("Publishing over {:?}", active),
                Some(ClientEvent::PrimaryStatus(status)) => info!("Presence link: {:?}", status.state),
                Some(ClientEvent::BrokerStatus(status)) => info!("Broker link: {:?}", status.state),
                Some(other) => log::debug!("{:?}", other),
                None => break,
            },

            _ = publish.tick() => {
                // Drive around a circle so others have something to watch
                let t = started.elapsed().as_secs_f32();
                let angle = t * 0.5;
                let sample = PresenceSample::new(Vec3::new(10.0 * angle.cos(), 0.0, 10.0 * angle.sin()), client.now_millis())
                    .with_velocity(Vec3::new(-5.0 * angle.sin(), 0.0, 5.0 * angle.cos()))
                    .with_orientation(Quat::from_yaw(angle))
                    .with_controls(ControlAxes::new(1.0, 0.3));
                client.publish(sample);
            }

            _ = render.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last_frame).as_secs_f32();
                last_frame = now;

                reconciler.pump();
                reconciler.tick(dt);
                frames += 1;

                if frames % 300 == 0 {
                    for id in reconciler.participants() {
                        if let Some(view) = reconciler.view(&id) {
                            info!(
                                "{} at ({:.2}, {:.2}, {:.2})",
                                client.display_name(&id).unwrap_or(&id),
                                view.position.x,
                                view.position.y,
                                view.position.z
                            );
                        }
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving session");
                client.close();
                break;
            }
        }
    }

    Ok(())
}
