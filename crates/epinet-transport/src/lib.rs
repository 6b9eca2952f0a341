//! epinet transport layer.
//!
//! Encrypted TCP connections between peers: a three-message plaintext
//! handshake establishes identities and a per-connection IV, after which
//! every frame travels inside an AES-128-CTR stream keyed by a pre-shared
//! secret. Each live connection is a [`Node`] with bounded mailboxes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use epinet_transport::{bootstrap, KeyGenerator, Message, Payload, Server, TransportConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), epinet_transport::TransportError> {
//! let keys = KeyGenerator::from_clock();
//! let me = keys.generate();
//!
//! let server = Server::bind("127.0.0.1:0".parse().unwrap(), me, TransportConfig::new(), keys.clone()).await?;
//! let config = server.config().clone();
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! tokio::spawn(server.run(tx));
//!
//! // Dial someone else
//! let peer = bootstrap("127.0.0.1:8080".parse().unwrap(), me, &config, &keys).await?;
//! let hello = Message::new(&keys, me, peer.id(), Payload::Heartbeat);
//! peer.send_message(hello, Duration::from_secs(1)).await?;
//!
//! // Inbound peers arrive on the channel
//! if let Some(inbound) = rx.recv().await {
//!     let msg = inbound.receive_message(Duration::from_secs(5)).await?;
//!     println!("{} says {}", msg.source(), msg.command());
//! }
//! # Ok(())
//! # }
//! ```

mod cipher;
mod client;
mod config;
mod error;
mod framing;
mod handshake;
mod key;
mod message;
mod node;
mod server;

pub use cipher::{random_iv, Iv, SessionKeys, IV_LEN, SECRET_LEN};
pub use client::bootstrap;
pub use config::{TransportConfig, DEFAULT_SECRET, HANDSHAKE_TIMEOUT, NODE_TIMEOUT};
pub use error::TransportError;
pub use handshake::{Handshake, HandshakeOutcome, HandshakeState, HandshakeStep, Role};
pub use key::{Key, KeyGenerator, KEY_LEN, NULL_KEY};
pub use message::{
    now_ms, Message, Payload, PeerAdvert, CMD_ACK, CMD_DATA, CMD_GOSSIP, CMD_HANDSHAKE,
    CMD_HEARTBEAT, CMD_LEADER_REPLY, CMD_QUERY_LEADER,
};
pub use node::{Direction, Node, Session};
pub use server::{accept_peer, Server};
