/// epinet-node: one overlay peer.
///
/// Binds the listener, optionally dials a bootstrap peer, then runs the
/// protocol engine until Ctrl+C.
///
/// Usage:
///   epinet-node                                   # listen on 127.0.0.1:8080
///   epinet-node --listen 0.0.0.0:9000 --bootstrap 10.0.0.2:8080
///   epinet-node --leader                          # answer leader queries as leader
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use epinet_protocol::{Protocol, ProtocolConfig, ProtocolEvent, TcpConnector};
use epinet_transport::{bootstrap, KeyGenerator, Server, TransportConfig, SECRET_LEN};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "epinet-node", about = "Gossip overlay node over encrypted TCP")]
struct Cli {
    /// Address the listener binds to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Peer to dial on startup.
    #[arg(long)]
    bootstrap: Option<SocketAddr>,

    /// Start as the leader.
    #[arg(long)]
    leader: bool,

    /// Pre-shared secret, exactly 16 characters. Overrides EPINET_SECRET.
    #[arg(long, value_parser = parse_secret)]
    secret: Option<[u8; SECRET_LEN]>,
}

fn parse_secret(s: &str) -> Result<[u8; SECRET_LEN], String> {
    s.as_bytes()
        .try_into()
        .map_err(|_| format!("secret must be exactly {SECRET_LEN} bytes, got {}", s.len()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let keys = KeyGenerator::from_clock();
    let local = keys.generate();

    let mut transport = TransportConfig::new();
    if let Some(secret) = cli.secret {
        transport = transport.secret(secret);
    }

    let server = Server::bind(cli.listen, local, transport, keys.clone())
        .await
        .with_context(|| format!("binding listener on {}", cli.listen))?;
    let listen_addr = server.local_addr()?;
    let transport = server.config().clone();

    eprintln!("epinet-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Key:       {local}");
    eprintln!("Listening: {listen_addr}");
    eprintln!();

    let (peer_tx, peer_rx) = mpsc::channel(16);
    tokio::spawn(server.run(peer_tx.clone()));

    if let Some(addr) = cli.bootstrap {
        match bootstrap(addr, local, &transport, &keys).await {
            Ok(node) => {
                tracing::info!(peer = %node.id(), %addr, "bootstrapped");
                peer_tx
                    .send(node)
                    .await
                    .context("protocol intake closed")?;
            }
            // Keep running: others can still dial us.
            Err(e) => tracing::error!(%addr, error = %e, "bootstrap failed"),
        }
    }

    let config = ProtocolConfig {
        is_leader: cli.leader,
        ..ProtocolConfig::default()
    };
    let connector = TcpConnector::new(local, transport, keys.clone());
    let channels = Protocol::spawn(local, keys, config, Arc::new(connector), peer_rx);
    let handle = channels.handle.clone();

    let mut events = channels.events;
    let mut data = channels.data;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });
    tokio::spawn(async move {
        while let Some(msg) = data.recv().await {
            tracing::info!(from = %msg.from, id = %msg.id, bytes = msg.body.len(), "data received");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn log_event(event: &ProtocolEvent) {
    match event {
        ProtocolEvent::PeerAdded {
            key,
            addr,
            direction,
        } => tracing::info!(peer = %key, %addr, ?direction, "peer joined"),
        ProtocolEvent::PeerEvicted { key } => tracing::info!(peer = %key, "peer timed out"),
        ProtocolEvent::LeaderFound { leader } => tracing::info!(%leader, "leader found"),
        ProtocolEvent::DialFailed { key, addr, reason } => {
            tracing::warn!(peer = %key, %addr, %reason, "could not reach gossiped peer")
        }
        other => tracing::debug!(event = ?other, "protocol event"),
    }
}
