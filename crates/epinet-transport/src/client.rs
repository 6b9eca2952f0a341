use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::cipher::SessionKeys;
use crate::config::TransportConfig;
use crate::handshake::Handshake;
use crate::key::{Key, KeyGenerator};
use crate::node::{Direction, Node, Session};
use crate::TransportError;

/// Dial a known peer and run the dialer side of the handshake.
///
/// Connect and handshake are each bounded by the handshake timeout.
pub async fn bootstrap(
    addr: SocketAddr,
    local: Key,
    config: &TransportConfig,
    keys: &KeyGenerator,
) -> Result<Node, TransportError> {
    let connect = tokio::time::timeout(config.handshake_timeout, TcpStream::connect(addr)).await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };
    stream.set_nodelay(true)?;

    let outcome = Handshake::dialer(local, config, keys).run(&mut stream).await?;

    tracing::info!(peer = %outcome.peer, %addr, system_port = outcome.peer_system_port, "peer bootstrapped");
    let session = Session {
        peer: outcome.peer,
        peer_system_port: outcome.peer_system_port,
        remote_addr: addr,
        direction: Direction::Outbound,
        keys: SessionKeys::new(config.secret, outcome.iv),
    };
    Ok(Node::spawn(session, stream, config))
}
