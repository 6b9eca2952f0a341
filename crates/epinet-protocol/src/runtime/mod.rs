/// Protocol runtime: the engine event loop plus its channel-based API.
///
/// The engine task owns the peer table. Applications talk to it through a
/// [`ProtocolHandle`] and observe it through the event and data channels in
/// [`ProtocolChannels`].
mod r#loop;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use epinet_transport::{Direction, Key, KeyGenerator, Node};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolConfig;
use crate::connector::Connector;
use crate::error::ProtocolError;
use crate::gossip::{gossip_worker, GossipRound};

use r#loop::Engine;

// ── Commands (app → engine) ───────────────────────────────────────────

/// Commands the application sends to the engine loop.
pub enum ProtocolCommand {
    /// Snapshot of the peer table.
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    /// Ask the network who the leader is.
    QueryLeader {
        reply: oneshot::Sender<Option<Key>>,
    },
    /// Change whether this node answers leader queries as leader.
    SetLeader(bool),
    /// Send opaque bytes to a tracked peer.
    SendData {
        to: Key,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    /// Close every peer and stop.
    Shutdown,
}

// ── Events (engine → app) ────────────────────────────────────────────

/// One row of [`ProtocolHandle::peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub key: Key,
    pub remote_addr: SocketAddr,
    pub system_port: u16,
    pub direction: Direction,
    pub idle: Duration,
}

impl From<&Node> for PeerInfo {
    fn from(node: &Node) -> Self {
        Self {
            key: node.id(),
            remote_addr: node.remote_addr(),
            system_port: node.system_port(),
            direction: node.direction(),
            idle: node.idle_for(),
        }
    }
}

/// Application bytes received from a peer.
#[derive(Debug, Clone)]
pub struct DeliveredData {
    pub from: Key,
    pub id: Key,
    pub timestamp: u64,
    pub body: Vec<u8>,
}

/// Protocol-level events the application may want to observe.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// A new peer entered the table.
    PeerAdded {
        key: Key,
        addr: SocketAddr,
        direction: Direction,
    },
    /// A second connection to a known peer displaced the first.
    PeerReplaced { key: Key, direction: Direction },
    /// A node was refused admission and closed.
    PeerRejected { key: Key, reason: String },
    /// The heartbeat sweep dropped a dead peer.
    PeerEvicted { key: Key },
    /// Gossip advertised an unknown peer and we are dialing it.
    DialStarted { key: Key, addr: SocketAddr },
    /// Dialing an advertised peer failed.
    DialFailed {
        key: Key,
        addr: SocketAddr,
        reason: String,
    },
    /// A leader query came back positive.
    LeaderFound { leader: Key },
}

// ── ProtocolHandle (app-facing API) ──────────────────────────────────

/// Handle to communicate with a running engine.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ProtocolHandle {
    cmd_tx: mpsc::Sender<ProtocolCommand>,
    local: Key,
}

impl ProtocolHandle {
    /// This node's identity.
    pub fn local_key(&self) -> Key {
        self.local
    }

    /// Currently tracked peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(ProtocolCommand::Peers { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers().await.len()
    }

    /// Ask every peer (hop count 0) whether it knows the leader.
    ///
    /// Answers immediately with our own key if we are the leader.
    pub async fn query_leader(&self) -> Result<Option<Key>, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ProtocolCommand::QueryLeader { reply: tx })
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    pub async fn set_leader(&self, is_leader: bool) -> Result<(), ProtocolError> {
        self.cmd_tx
            .send(ProtocolCommand::SetLeader(is_leader))
            .await
            .map_err(|_| ProtocolError::Shutdown)
    }

    /// Send opaque bytes to a tracked peer.
    pub async fn send_data(&self, to: Key, body: Vec<u8>) -> Result<(), ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ProtocolCommand::SendData {
                to,
                body,
                reply: tx,
            })
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        rx.await.map_err(|_| ProtocolError::Shutdown)?
    }

    /// Close every peer connection and stop the engine.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ProtocolCommand::Shutdown).await;
    }
}

// ── ProtocolChannels ─────────────────────────────────────────────────

/// Channels returned to the application when the engine starts.
pub struct ProtocolChannels {
    /// Handle to send commands to the engine.
    pub handle: ProtocolHandle,
    /// Receive protocol-level events.
    pub events: mpsc::Receiver<ProtocolEvent>,
    /// Receive application data from peers.
    pub data: mpsc::Receiver<DeliveredData>,
}

// ── Protocol ─────────────────────────────────────────────────────────

/// The protocol engine. Spawn it and communicate via channels.
pub struct Protocol;

impl Protocol {
    /// Start the engine loop and the gossip worker.
    ///
    /// Handshaken nodes (from a [`Server`](epinet_transport::Server) or a
    /// bootstrap dial) are fed in through `new_peers`; `connector` is used to
    /// dial peers learned from gossip.
    pub fn spawn(
        local: Key,
        keys: KeyGenerator,
        config: ProtocolConfig,
        connector: Arc<dyn Connector>,
        new_peers: mpsc::Receiver<Node>,
    ) -> ProtocolChannels {
        let capacity = config.channel_capacity.max(1);

        // Command channel (app → engine)
        let (cmd_tx, cmd_rx) = mpsc::channel::<ProtocolCommand>(capacity);

        // Event channels (engine → app)
        let (event_tx, event_rx) = mpsc::channel::<ProtocolEvent>(capacity);
        let (data_tx, data_rx) = mpsc::channel::<DeliveredData>(capacity);

        // One round in flight at most
        let (gossip_tx, gossip_rx) = mpsc::channel::<GossipRound>(1);
        let shutdown = CancellationToken::new();

        tokio::spawn(gossip_worker(
            local,
            keys.clone(),
            config.gossip_send_timeout,
            gossip_rx,
            shutdown.clone(),
        ));

        let (engine, dial_rx) =
            Engine::new(local, keys, config, connector, event_tx, data_tx, gossip_tx);
        tokio::spawn(r#loop::engine_loop(
            engine, cmd_rx, new_peers, dial_rx, shutdown,
        ));

        tracing::info!(%local, "protocol engine started");
        ProtocolChannels {
            handle: ProtocolHandle {
                cmd_tx,
                local,
            },
            events: event_rx,
            data: data_rx,
        }
    }
}
