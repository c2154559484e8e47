use clap::Parser;
use convoy_server::{PresenceServer, ServerConfig};
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Presence broadcasts per second
    #[clap(short, long, default_value = "30")]
    tick_rate: u32,
    /// Frames buffered per connection before deltas are dropped
    #[clap(long, default_value = "64")]
    outbound_capacity: usize,
    /// Seconds of silence before a participant is removed
    #[clap(long, default_value = "15")]
    heartbeat_timeout_secs: u64,
    /// Frames a relay subscriber may lag behind its publisher
    #[clap(long, default_value = "32")]
    relay_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        tick_rate: args.tick_rate,
        outbound_capacity: args.outbound_capacity,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        relay_capacity: args.relay_capacity,
    };
    let server = PresenceServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
