/// Gossip fan-out.
///
/// The engine hands the worker a [`GossipRound`] snapshot each gossip tick.
/// The worker never touches the peer table; for each recipient in the
/// snapshot it sends the adverts of every other valid peer.
use std::time::Duration;

use epinet_transport::{Key, KeyGenerator, Message, Node, Payload, PeerAdvert};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Every node the engine tracked when the round was cut.
#[derive(Debug, Clone)]
pub struct GossipRound {
    pub peers: Vec<Node>,
}

/// Adverts of every valid peer in `snapshot` except `recipient`.
pub fn adverts_for(recipient: &Node, snapshot: &[Node]) -> Vec<PeerAdvert> {
    snapshot
        .iter()
        .filter(|node| node.id() != recipient.id() && node.is_valid())
        .map(Node::advert)
        .collect()
}

/// Send one gossip message to each valid peer of the round.
///
/// Returns how many sends succeeded.
pub async fn run_round(
    local: Key,
    keys: &KeyGenerator,
    round: &GossipRound,
    send_timeout: Duration,
) -> usize {
    let mut sent = 0;
    for recipient in round.peers.iter().filter(|n| n.is_valid()) {
        let entries = adverts_for(recipient, &round.peers);
        let count = entries.len();
        let msg = Message::new(keys, local, recipient.id(), Payload::Gossip { entries });
        match recipient.send_message(msg, send_timeout).await {
            Ok(()) => {
                tracing::trace!(peer = %recipient.id(), entries = count, "gossip sent");
                sent += 1;
            }
            Err(e) => {
                tracing::debug!(peer = %recipient.id(), error = %e, "gossip send failed");
            }
        }
    }
    sent
}

/// Drain rounds until the queue closes or `shutdown` fires.
pub(crate) async fn gossip_worker(
    local: Key,
    keys: KeyGenerator,
    send_timeout: Duration,
    mut rounds: mpsc::Receiver<GossipRound>,
    shutdown: CancellationToken,
) {
    loop {
        let round = tokio::select! {
            _ = shutdown.cancelled() => break,
            round = rounds.recv() => match round {
                Some(round) => round,
                None => break,
            },
        };
        let sent = run_round(local, &keys, &round, send_timeout).await;
        tracing::debug!(peers = round.peers.len(), sent, "gossip round done");
    }
    tracing::debug!("gossip worker stopped");
}
