//! epinet protocol layer.
//!
//! Runs on top of `epinet-transport`: keeps a table of live peers, sends
//! heartbeats and sweeps dead peers, gossips peer adverts so the overlay
//! discovers itself, and answers hop-bounded leader queries.
//!
//! The [`Protocol`] engine owns all state in one task; applications drive
//! it with a [`ProtocolHandle`] and listen on the channels returned in
//! [`ProtocolChannels`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use epinet_protocol::{Protocol, ProtocolConfig, TcpConnector};
//! use epinet_transport::{KeyGenerator, Server, TransportConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = KeyGenerator::from_clock();
//! let me = keys.generate();
//! let server = Server::bind("0.0.0.0:8080".parse()?, me, TransportConfig::new(), keys.clone()).await?;
//! let connector = TcpConnector::new(me, server.config().clone(), keys.clone());
//!
//! let (peer_tx, peer_rx) = tokio::sync::mpsc::channel(16);
//! tokio::spawn(server.run(peer_tx));
//!
//! let mut channels = Protocol::spawn(me, keys, ProtocolConfig::default(), Arc::new(connector), peer_rx);
//! while let Some(event) = channels.events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod gossip;
pub mod leader;
pub mod peers;
pub mod runtime;

pub use config::{
    ProtocolConfig, GOSSIP_INTERVAL, HEARTBEAT_INTERVAL, LEADER_REPLY_TIMEOUT, MAX_LEADER_HOPS,
};
pub use connector::{Connector, TcpConnector};
pub use error::ProtocolError;
pub use gossip::GossipRound;
pub use leader::{LeaderDecision, Probe};
pub use peers::{Admission, PeerTable};
pub use runtime::{
    DeliveredData, PeerInfo, Protocol, ProtocolChannels, ProtocolCommand, ProtocolEvent,
    ProtocolHandle,
};
