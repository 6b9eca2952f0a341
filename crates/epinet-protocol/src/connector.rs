use std::net::SocketAddr;

use epinet_transport::{Key, KeyGenerator, Node, TransportConfig, TransportError};

/// How the engine opens outbound connections.
///
/// In production: [`TcpConnector`] (TCP + dialer handshake).
/// In tests: a mock that records the dial attempts.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial `addr` and return the handshaken node.
    async fn connect(&self, addr: SocketAddr) -> Result<Node, TransportError>;
}

/// Dials over TCP with [`epinet_transport::bootstrap`].
#[derive(Debug, Clone)]
pub struct TcpConnector {
    local: Key,
    config: TransportConfig,
    keys: KeyGenerator,
}

impl TcpConnector {
    /// `config` should carry the system port our listener advertises.
    pub fn new(local: Key, config: TransportConfig, keys: KeyGenerator) -> Self {
        Self {
            local,
            config,
            keys,
        }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Node, TransportError> {
        epinet_transport::bootstrap(addr, self.local, &self.config, &self.keys).await
    }
}

// ── MockConnector (tests) ────────────────────────────────────────────
