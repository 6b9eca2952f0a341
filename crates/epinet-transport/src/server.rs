use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::cipher::{random_iv, SessionKeys};
use crate::config::TransportConfig;
use crate::handshake::Handshake;
use crate::key::{Key, KeyGenerator};
use crate::node::{Direction, Node, Session};
use crate::TransportError;

/// Accepts inbound connections and turns each successful handshake into a
/// [`Node`].
pub struct Server {
    listener: TcpListener,
    local: Key,
    config: TransportConfig,
    keys: KeyGenerator,
}

impl Server {
    /// Bind the listener.
    ///
    /// If the config carries no system port, the bound port is advertised.
    pub async fn bind(
        addr: SocketAddr,
        local: Key,
        config: TransportConfig,
        keys: KeyGenerator,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let bound = listener.local_addr()?;

        let mut config = config;
        if config.system_port == 0 {
            config.system_port = bound.port();
        }

        tracing::info!(%local, addr = %bound, system_port = config.system_port, "listening");
        Ok(Self {
            listener,
            local,
            config,
            keys,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn local_key(&self) -> Key {
        self.local
    }

    /// The effective config, with the system port filled in.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Accept until `new_peers` is closed.
    ///
    /// Every connection is handshaken on its own task; failures are logged
    /// and never stop the listener.
    pub async fn run(self, new_peers: mpsc::Sender<Node>) {
        loop {
            let (stream, remote) = tokio::select! {
                _ = new_peers.closed() => {
                    tracing::debug!("peer intake closed, listener stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let local = self.local;
            let config = self.config.clone();
            let keys = self.keys.clone();
            let new_peers = new_peers.clone();
            tokio::spawn(async move {
                match accept_peer(stream, remote, local, &config, &keys).await {
                    Ok(node) => {
                        if let Err(mpsc::error::SendError(node)) = new_peers.send(node).await {
                            node.close();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "inbound handshake failed");
                    }
                }
            });
        }
    }
}

/// Listener side of the handshake on a freshly accepted socket.
///
/// A fresh IV is drawn for every connection.
pub async fn accept_peer(
    mut stream: TcpStream,
    remote: SocketAddr,
    local: Key,
    config: &TransportConfig,
    keys: &KeyGenerator,
) -> Result<Node, TransportError> {
    stream.set_nodelay(true)?;
    let iv = random_iv();
    let outcome = Handshake::listener(iv, local, config, keys)
        .run(&mut stream)
        .await?;

    tracing::info!(peer = %outcome.peer, %remote, system_port = outcome.peer_system_port, "peer accepted");
    let session = Session {
        peer: outcome.peer,
        peer_system_port: outcome.peer_system_port,
        remote_addr: remote,
        direction: Direction::Inbound,
        keys: SessionKeys::new(config.secret, iv),
    };
    Ok(Node::spawn(session, stream, config))
}
