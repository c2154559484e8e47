//! # Convoy Presence Client
//!
//! Client side of presence synchronization: keeps the links to the server
//! alive, follows the session roster and turns remote samples into smooth,
//! queryable positions.
//!
//! ## Architecture Overview
//!
//! ### Resilient Channels (`channel`)
//! Every link to the server is a [`channel::ResilientChannel`]. It owns one
//! background task that connects, reconnects with capped exponential
//! backoff and reports each state change. A transport that is not
//! available at all is reported once as unsupported and never retried.
//!
//! ### Primary Transport (`primary`)
//! The presence endpoint sends full syncs, deltas and membership changes.
//! Deltas are rebuilt on top of the last full sample per participant.
//!
//! ### Alternate Transport (`peer`)
//! The discovery broker lists everyone in the session together with a
//! reachability token. The [`peer::PeerSessionManager`] keeps exactly one
//! subscription per remote participant and publishes local samples on the
//! participant's own token.
//!
//! ### Reconciliation (`reconciler`)
//! Both transports write into one [`reconciler::ReconcilerFeed`]. The
//! [`reconciler::PresenceReconciler`] dead-reckons each participant from
//! its latest sample and smooths the displayed position toward it.
//!
//! ### Coordination (`session`)
//! [`session::PresenceClient`] wires it all together and decides which
//! transport outbound samples use.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use convoy_client::{
//!     ClientConfig, PresenceClient, PresenceReconciler, ReconcilerConfig, WsPeerTransport,
//!     WsTransport,
//! };
//! use convoy_shared::{PresenceSample, Vec3};
//!
//! # async fn demo() {
//! let config = ClientConfig::default();
//! let (mut reconciler, feed) = PresenceReconciler::new(ReconcilerConfig::default());
//! reconciler.set_local_id(config.participant_id.clone());
//!
//! let peers = WsPeerTransport::new(config.server_url.clone(), 32);
//! let mut client = PresenceClient::connect(
//!     config,
//!     WsTransport::new(),
//!     WsTransport::new(),
//!     peers,
//!     feed,
//!     PresenceSample::new(Vec3::ZERO, 0),
//! );
//!
//! while let Some(event) = client.next_event().await {
//!     println!("{:?}", event);
//!     reconciler.pump();
//!     reconciler.tick(1.0 / 60.0);
//! }
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod peer;
pub mod primary;
pub mod reconciler;
pub mod session;
pub mod transport;

pub use channel::{BackoffPolicy, ChannelStatus, ConnectionState, ResilientChannel};
pub use config::ClientConfig;
pub use peer::{PeerEvent, PeerSessionManager, SubscriptionRetry};
pub use reconciler::{PresenceReconciler, PresenceView, ReconcilerConfig, ReconcilerFeed};
pub use session::{ActiveTransport, ClientEvent, PresenceClient, TransportSelector};
pub use transport::{TransportError, WsPeerTransport, WsTransport};
