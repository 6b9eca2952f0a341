/// Hop-bounded leader queries.
///
/// A node that is not the leader itself forwards the query to all its other
/// peers at once and waits one shared reply window for the answers. This is
/// a best-effort probe, not an election.
use std::time::Duration;

use epinet_transport::{Key, KeyGenerator, Message, Node, Payload, TransportError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What to do with an incoming `query_leader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderDecision {
    /// We are the leader: answer with our own key.
    ReplyLeader,
    /// Hop bound exceeded: answer negatively without forwarding.
    ReplyEmpty,
    /// Ask our other peers, carrying `hops`.
    Forward { hops: u32 },
}

pub fn decide(is_leader: bool, hops: u32, max_hops: u32) -> LeaderDecision {
    if is_leader {
        LeaderDecision::ReplyLeader
    } else if hops > max_hops {
        LeaderDecision::ReplyEmpty
    } else {
        LeaderDecision::Forward {
            hops: hops.saturating_add(1),
        }
    }
}

/// Result of a [`probe`].
#[derive(Debug, Default)]
pub struct Probe {
    /// First leader reported, if any.
    pub leader: Option<Key>,
    /// Non-reply messages pulled from target mailboxes while waiting, with
    /// the node each came from, in arrival order per node. The caller owns
    /// dispatching them.
    pub drawn: Vec<(Node, Message)>,
}

/// Send `query_leader { hops }` to every target and wait up to
/// `reply_timeout` for a positive answer.
pub async fn probe(
    local: Key,
    keys: &KeyGenerator,
    targets: Vec<Node>,
    hops: u32,
    send_timeout: Duration,
    reply_timeout: Duration,
) -> Probe {
    let mut result = Probe::default();
    if targets.is_empty() {
        return result;
    }

    let deadline = Instant::now() + reply_timeout;
    let found = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for target in targets {
        let query = Message::new(keys, local, target.id(), Payload::QueryLeader { hops });
        tasks.spawn(ask(target, query, send_timeout, deadline, found.clone()));
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(answer) => {
                if result.leader.is_none() {
                    result.leader = answer.leader;
                }
                result
                    .drawn
                    .extend(answer.drawn.into_iter().map(|msg| (answer.target.clone(), msg)));
            }
            Err(e) => tracing::warn!(error = %e, "leader probe task failed"),
        }
    }
    result
}

struct Answer {
    target: Node,
    leader: Option<Key>,
    drawn: Vec<Message>,
}

async fn ask(
    target: Node,
    query: Message,
    send_timeout: Duration,
    deadline: Instant,
    found: CancellationToken,
) -> Answer {
    let peer = target.id();
    let mut answer = Answer {
        target: target.clone(),
        leader: None,
        drawn: Vec::new(),
    };
    if let Err(e) = target.send_message(query, send_timeout).await {
        tracing::debug!(%peer, error = %e, "leader query not sent");
        return answer;
    }

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!(%peer, "no leader reply in time");
            break;
        }
        let next = tokio::select! {
            _ = found.cancelled() => break,
            next = target.receive_message(remaining) => next,
        };
        match next {
            Ok(msg) => match msg.payload() {
                Payload::LeaderReply { leader, .. } => {
                    answer.leader = *leader;
                    break;
                }
                _ => answer.drawn.push(msg),
            },
            Err(TransportError::Timeout) => {
                tracing::debug!(%peer, "no leader reply in time");
                break;
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "leader probe aborted");
                break;
            }
        }
    }

    if answer.leader.is_some() {
        found.cancel();
    }
    answer
}
