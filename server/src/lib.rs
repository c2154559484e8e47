//! # Convoy Presence Server
//!
//! Authoritative side of presence synchronization. A single WebSocket
//! listener hosts three cooperating services.
//!
//! ## Presence Broadcaster (`broadcaster`)
//! One tick loop per session. Connections write their latest sample into a
//! slot; every tick the loop sends a full sync to members that need one and
//! a delta of changed participants to everyone else. Joins and leaves are
//! announced immediately, outside the tick.
//!
//! ## Discovery Broker (`broker`, `registry`)
//! Tracks who is present in each session and how to reach them on the
//! alternate transport, pushing the full membership on every change. Each
//! connection's view leaves out its own participant.
//!
//! ## Relay (`relay`)
//! Publish/subscribe tracks keyed by reachability token. This is the data
//! plane peers use once the broker has told them about each other.
//!
//! ## Backpressure
//! Nothing in a tick loop or the broker waits on a socket. Frames go into a
//! bounded [`outbound::OutboundQueue`] per connection, drained by a writer
//! task. A slow consumer loses deltas and receives a full resync instead.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use convoy_server::{PresenceServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "0.0.0.0:8080".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     PresenceServer::new(config).run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod broker;
pub mod config;
pub mod network;
pub mod outbound;
pub mod registry;
pub mod relay;

pub use config::ServerConfig;
pub use network::{PresenceServer, ServerError};

/// Server-assigned identifier of one WebSocket connection.
pub type ConnectionId = u64;
