/// The engine event loop.
///
/// A single task that owns the peer table and multiplexes over application
/// commands, new-peer intake, dial results and three timers (heartbeat,
/// gossip, mailbox poll).
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use epinet_transport::{
    Key, KeyGenerator, Message, Node, Payload, PeerAdvert, TransportError,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolConfig;
use crate::connector::Connector;
use crate::error::ProtocolError;
use crate::gossip::GossipRound;
use crate::leader::{self, LeaderDecision};
use crate::peers::{Admission, PeerTable};

use super::{DeliveredData, PeerInfo, ProtocolCommand, ProtocolEvent};

/// Result of a gossip-triggered dial, fed back into the loop.
pub(super) struct DialOutcome {
    key: Key,
    addr: SocketAddr,
    result: Result<Node, TransportError>,
}

/// All mutable engine state.
pub(super) struct Engine {
    local: Key,
    keys: KeyGenerator,
    config: ProtocolConfig,
    is_leader: bool,
    table: PeerTable,
    connector: Arc<dyn Connector>,
    pending_dials: HashSet<Key>,
    dial_tx: mpsc::Sender<DialOutcome>,
    event_tx: mpsc::Sender<ProtocolEvent>,
    data_tx: mpsc::Sender<DeliveredData>,
    gossip_tx: mpsc::Sender<GossipRound>,
}

/// Main event loop.
pub(super) async fn engine_loop(
    mut engine: Engine,
    mut cmd_rx: mpsc::Receiver<ProtocolCommand>,
    mut new_peers: mpsc::Receiver<Node>,
    mut dial_rx: mpsc::Receiver<DialOutcome>,
    shutdown: CancellationToken,
) {
    // ── Timers ──────────────────────────────────────────────────────
    let mut heartbeat = tokio::time::interval(engine.config.heartbeat_interval);
    let mut gossip = tokio::time::interval(engine.config.gossip_interval);
    let mut poll = tokio::time::interval(engine.config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the immediate first tick
    heartbeat.tick().await;
    gossip.tick().await;

    let mut intake_open = true;

    loop {
        tokio::select! {
            biased;

            // ── 1. Application commands ─────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ProtocolCommand::Shutdown) | None => break,
                    Some(cmd) => engine.handle_command(cmd).await,
                }
            }

            // ── 2. New peers from the listener / bootstrap ──────────
            node = new_peers.recv(), if intake_open => {
                match node {
                    Some(node) => engine.admit(node),
                    None => {
                        tracing::debug!("peer intake closed");
                        intake_open = false;
                    }
                }
            }

            // ── 3. Finished dials ───────────────────────────────────
            Some(outcome) = dial_rx.recv() => engine.on_dial(outcome),

            // ── 4. Heartbeat sweep ──────────────────────────────────
            _ = heartbeat.tick() => engine.heartbeat(),

            // ── 5. Gossip round ─────────────────────────────────────
            _ = gossip.tick() => engine.gossip(),

            // ── 6. Mailbox poll ─────────────────────────────────────
            _ = poll.tick() => engine.poll().await,
        }
    }

    engine.shutdown();
    shutdown.cancel();
    tracing::info!(local = %engine.local, "protocol engine stopped");
}

impl Engine {
    pub(super) fn new(
        local: Key,
        keys: KeyGenerator,
        config: ProtocolConfig,
        connector: Arc<dyn Connector>,
        event_tx: mpsc::Sender<ProtocolEvent>,
        data_tx: mpsc::Sender<DeliveredData>,
        gossip_tx: mpsc::Sender<GossipRound>,
    ) -> (Self, mpsc::Receiver<DialOutcome>) {
        let (dial_tx, dial_rx) = mpsc::channel(config.channel_capacity.max(1));
        let engine = Self {
            local,
            keys,
            is_leader: config.is_leader,
            config,
            table: PeerTable::new(local),
            connector,
            pending_dials: HashSet::new(),
            dial_tx,
            event_tx,
            data_tx,
            gossip_tx,
        };
        (engine, dial_rx)
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.event_tx.try_send(event);
    }

    // ── Admission ────────────────────────────────────────────────────

    fn admit(&mut self, node: Node) {
        let key = node.id();
        let direction = node.direction();
        match self.table.admit(node.clone()) {
            Ok(Admission::Inserted) => {
                tracing::info!(peer = %key, addr = %node.remote_addr(), ?direction, "peer added");
                self.emit(ProtocolEvent::PeerAdded {
                    key,
                    addr: node.remote_addr(),
                    direction,
                });
            }
            Ok(Admission::Replaced { previous }) => {
                previous.close();
                tracing::info!(peer = %key, ?direction, "peer connection replaced");
                self.emit(ProtocolEvent::PeerReplaced { key, direction });
            }
            Err(e) => {
                tracing::debug!(peer = %key, error = %e, "peer rejected");
                node.close();
                self.emit(ProtocolEvent::PeerRejected {
                    key,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn dial(&mut self, advert: PeerAdvert) {
        let key = advert.key;
        let addr = advert.socket_addr();
        self.pending_dials.insert(key);
        tracing::debug!(peer = %key, %addr, "dialing gossiped peer");
        self.emit(ProtocolEvent::DialStarted { key, addr });

        let connector = Arc::clone(&self.connector);
        let dial_tx = self.dial_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(addr).await;
            let _ = dial_tx.send(DialOutcome { key, addr, result }).await;
        });
    }

    fn on_dial(&mut self, outcome: DialOutcome) {
        let DialOutcome { key, addr, result } = outcome;
        self.pending_dials.remove(&key);
        match result {
            Ok(node) => {
                if node.id() != key {
                    tracing::warn!(advertised = %key, actual = %node.id(), %addr, "dialed peer presented a different key");
                }
                self.admit(node);
            }
            Err(e) => {
                tracing::warn!(peer = %key, %addr, error = %e, "dial failed");
                self.emit(ProtocolEvent::DialFailed {
                    key,
                    addr,
                    reason: e.to_string(),
                });
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Evict dead peers, then send each live one a heartbeat.
    fn heartbeat(&mut self) {
        for node in self.table.sweep() {
            tracing::info!(peer = %node.id(), idle = ?node.idle_for(), "evicting dead peer");
            node.close();
            self.emit(ProtocolEvent::PeerEvicted { key: node.id() });
        }

        let timeout = self.config.heartbeat_send_timeout;
        for node in self.table.nodes() {
            let msg = Message::new(&self.keys, self.local, node.id(), Payload::Heartbeat);
            tokio::spawn(async move {
                if let Err(e) = node.send_message(msg, timeout).await {
                    tracing::debug!(peer = %node.id(), error = %e, "heartbeat not sent");
                }
            });
        }
    }

    fn gossip(&mut self) {
        if self.table.is_empty() {
            return;
        }
        let round = GossipRound {
            peers: self.table.nodes(),
        };
        match self.gossip_tx.try_send(round) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("gossip worker busy, skipping round");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("gossip worker gone");
            }
        }
    }

    /// One short receive attempt per tracked peer.
    async fn poll(&mut self) {
        let timeout = self.config.poll_timeout;
        for node in self.table.nodes() {
            match node.receive_message(timeout).await {
                Ok(msg) => self.dispatch(&node, msg).await,
                Err(TransportError::Timeout) => {}
                // Left for the next heartbeat sweep.
                Err(TransportError::NodeClosed(_)) => {}
                Err(e) => tracing::debug!(peer = %node.id(), error = %e, "receive failed"),
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    async fn dispatch(&mut self, from: &Node, msg: Message) {
        match msg.payload() {
            Payload::QueryLeader { hops } => {
                let hops = *hops;
                self.answer_leader_query(from, &msg, hops).await;
            }
            _ => self.handle_message(msg),
        }
    }

    /// Everything except leader queries, which need to await a probe.
    fn handle_message(&mut self, msg: Message) {
        let source = msg.source();
        match msg.payload() {
            Payload::Gossip { entries } => {
                let fresh: Vec<PeerAdvert> = entries
                    .iter()
                    .filter(|advert| self.should_dial(&advert.key))
                    .copied()
                    .collect();
                tracing::trace!(peer = %source, advertised = entries.len(), new = fresh.len(), "gossip received");
                for advert in fresh {
                    // an advert may be listed twice in one message
                    if self.should_dial(&advert.key) {
                        self.dial(advert);
                    }
                }
            }
            Payload::Heartbeat => {
                if !self.table.refresh(&source) {
                    tracing::debug!(peer = %source, "heartbeat from untracked peer");
                }
            }
            Payload::QueryLeader { .. } => {
                tracing::debug!(peer = %source, "leader query outside dispatch");
            }
            Payload::LeaderReply { .. } => {
                tracing::debug!(peer = %source, "ignoring late leader reply");
            }
            Payload::Data { .. } => {
                let id = msg.id();
                let timestamp = msg.timestamp();
                let Payload::Data { body } = msg.into_payload() else {
                    return;
                };
                let delivered = DeliveredData {
                    from: source,
                    id,
                    timestamp,
                    body,
                };
                if self.data_tx.try_send(delivered).is_err() {
                    tracing::warn!(peer = %source, "data channel full, dropping message");
                }
            }
            Payload::Handshake { .. } | Payload::Ack => {
                tracing::debug!(peer = %source, command = msg.command(), "handshake message after handshake");
            }
            Payload::Unknown { command } => {
                tracing::warn!(peer = %source, %command, "unrecognized command");
            }
        }
    }

    /// Handle traffic a leader probe pulled from peer mailboxes. Nested
    /// leader queries go back to their node to be answered on a later poll.
    fn settle_drawn(&mut self, drawn: Vec<(Node, Message)>) {
        for (node, msg) in drawn {
            if matches!(msg.payload(), Payload::QueryLeader { .. }) {
                if let Err(e) = node.requeue_message(msg) {
                    tracing::warn!(peer = %node.id(), error = %e, "dropping leader query drawn during probe");
                }
            } else {
                self.handle_message(msg);
            }
        }
    }

    fn should_dial(&self, key: &Key) -> bool {
        !key.is_null()
            && *key != self.local
            && !self.table.contains(key)
            && !self.pending_dials.contains(key)
    }

    async fn answer_leader_query(&mut self, from: &Node, query: &Message, hops: u32) {
        let leader = match leader::decide(self.is_leader, hops, self.config.max_leader_hops) {
            LeaderDecision::ReplyLeader => Some(self.local),
            LeaderDecision::ReplyEmpty => {
                tracing::debug!(peer = %query.source(), hops, "leader query over hop bound");
                None
            }
            LeaderDecision::Forward { hops: next } => {
                let targets: Vec<Node> = self
                    .table
                    .nodes()
                    .into_iter()
                    .filter(|n| n.id() != query.source() && !n.same_connection(from))
                    .collect();
                self.probe(targets, next).await
            }
        };

        let reply = Message::new(
            &self.keys,
            self.local,
            query.source(),
            Payload::LeaderReply { hops, leader },
        );
        if let Err(e) = from.send_message(reply, self.config.data_send_timeout).await {
            tracing::debug!(peer = %from.id(), error = %e, "leader reply not sent");
        }
    }

    async fn probe(&mut self, targets: Vec<Node>, hops: u32) -> Option<Key> {
        let probe = leader::probe(
            self.local,
            &self.keys,
            targets,
            hops,
            self.config.data_send_timeout,
            self.config.leader_reply_timeout,
        )
        .await;
        self.settle_drawn(probe.drawn);
        if let Some(leader) = probe.leader {
            self.emit(ProtocolEvent::LeaderFound { leader });
        }
        probe.leader
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: ProtocolCommand) {
        match cmd {
            ProtocolCommand::Peers { reply } => {
                let peers = self.table.nodes().iter().map(PeerInfo::from).collect();
                let _ = reply.send(peers);
            }
            ProtocolCommand::QueryLeader { reply } => {
                let leader = if self.is_leader {
                    Some(self.local)
                } else {
                    let targets = self.table.nodes();
                    self.probe(targets, 0).await
                };
                let _ = reply.send(leader);
            }
            ProtocolCommand::SetLeader(is_leader) => {
                tracing::info!(is_leader, "leadership changed");
                self.is_leader = is_leader;
            }
            ProtocolCommand::SendData { to, body, reply } => {
                let _ = reply.send(self.send_data(to, body).await);
            }
            ProtocolCommand::Shutdown => {}
        }
    }

    async fn send_data(&self, to: Key, body: Vec<u8>) -> Result<(), ProtocolError> {
        let node = self.table.get(&to).ok_or(ProtocolError::PeerNotFound(to))?;
        let msg = Message::new(&self.keys, self.local, to, Payload::Data { body });
        node.send_message(msg, self.config.data_send_timeout).await?;
        Ok(())
    }

    fn shutdown(&mut self) {
        tracing::info!(peers = self.table.len(), "closing all peers");
        self.table.close_all();
        self.pending_dials.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use epinet_transport::{Direction, TransportConfig};

    use crate::connector::mock::MockConnector;
    use crate::testutil;

    struct Harness {
        engine: Engine,
        connector: MockConnector,
        dial_rx: mpsc::Receiver<DialOutcome>,
        events: mpsc::Receiver<ProtocolEvent>,
        data: mpsc::Receiver<DeliveredData>,
        gossip_rx: mpsc::Receiver<GossipRound>,
    }

    fn harness(keys: &KeyGenerator, config: ProtocolConfig) -> Harness {
        let connector = MockConnector::new();
        let (event_tx, events) = mpsc::channel(64);
        let (data_tx, data) = mpsc::channel(64);
        let (gossip_tx, gossip) = mpsc::channel(1);
        let (engine, dial_rx) = Engine::new(
            keys.generate(),
            keys.clone(),
            config,
            Arc::new(connector.clone()),
            event_tx,
            data_tx,
            gossip_tx,
        );
        Harness {
            engine,
            connector,
            dial_rx,
            events,
            data,
            gossip_rx: gossip,
        }
    }

    fn drain(events: &mut mpsc::Receiver<ProtocolEvent>) -> Vec<ProtocolEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn gossip_of(keys: &KeyGenerator, from: Key, to: Key, entries: Vec<PeerAdvert>) -> Message {
        Message::new(keys, from, to, Payload::Gossip { entries })
    }

    #[tokio::test]
    async fn gossip_dials_each_unknown_peer_once() {
        let keys = KeyGenerator::seeded(40);
        let mut h = harness(&keys, ProtocolConfig::default());
        let config = TransportConfig::new();
        let local = h.engine.local;

        let (relay, _relay_remote) = testutil::linked(local, keys.generate(), &config);
        h.engine.admit(relay.clone());
        let (known, _known_remote) = testutil::linked(local, keys.generate(), &config);
        h.engine.admit(known.clone());

        let unknown = PeerAdvert::new(keys.generate(), "127.0.0.1".parse().unwrap(), 7100);
        let entries = vec![known.advert(), unknown, unknown, PeerAdvert::new(local, "127.0.0.1".parse().unwrap(), 1)];

        let msg = gossip_of(&keys, relay.id(), local, entries.clone());
        h.engine.dispatch(&relay, msg).await;
        // second copy while the first dial is still in flight
        let msg = gossip_of(&keys, relay.id(), local, entries);
        h.engine.dispatch(&relay, msg).await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), h.dial_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.key, unknown.key);
        assert!(outcome.result.is_err());
        assert_eq!(h.connector.attempts(), vec![unknown.socket_addr()]);

        h.engine.on_dial(outcome);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(e, ProtocolEvent::DialStarted { key, .. } if *key == unknown.key)));
        assert!(events.iter().any(|e| matches!(e, ProtocolEvent::DialFailed { key, .. } if *key == unknown.key)));
        assert!(h.engine.pending_dials.is_empty());
    }

    #[tokio::test]
    async fn successful_dial_is_admitted() {
        let keys = KeyGenerator::seeded(41);
        let mut h = harness(&keys, ProtocolConfig::default());
        let config = TransportConfig::new();
        let local = h.engine.local;

        let (relay, _relay_remote) = testutil::linked(local, keys.generate(), &config);
        h.engine.admit(relay.clone());

        let target = PeerAdvert::new(keys.generate(), "127.0.0.1".parse().unwrap(), 7200);
        h.connector.serve(target.socket_addr(), target.key);
        let msg = gossip_of(&keys, relay.id(), local, vec![target]);
        h.engine.dispatch(&relay, msg).await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), h.dial_rx.recv())
            .await
            .unwrap()
            .unwrap();
        h.engine.on_dial(outcome);
        assert!(h.engine.table.contains(&target.key));
        assert_eq!(h.engine.table.get(&target.key).unwrap().direction(), Direction::Outbound);

        // already tracked: no second dial
        let msg = gossip_of(&keys, relay.id(), local, vec![target]);
        h.engine.dispatch(&relay, msg).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_the_table_entry_by_source() {
        let keys = KeyGenerator::seeded(42);
        let mut h = harness(&keys, ProtocolConfig::default());
        let config = TransportConfig::new().node_timeout(Duration::from_millis(60));
        let local = h.engine.local;

        let (tracked, _remote) = testutil::node(keys.generate(), Direction::Inbound, &config);
        h.engine.admit(tracked.clone());
        let (other, _other_remote) = testutil::node(keys.generate(), Direction::Inbound, &config);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!tracked.is_valid());

        // delivered on a different node, but names the tracked peer as source
        let beat = Message::new(&keys, tracked.id(), local, Payload::Heartbeat);
        h.engine.dispatch(&other, beat).await;
        assert!(tracked.is_valid());
    }

    #[tokio::test]
    async fn sweep_evicts_stale_peer_once() {
        let keys = KeyGenerator::seeded(43);
        let mut h = harness(&keys, ProtocolConfig::default());
        let config = TransportConfig::new().node_timeout(Duration::from_millis(40));

        let (stale, _remote) = testutil::node(keys.generate(), Direction::Inbound, &config);
        h.engine.admit(stale.clone());
        drain(&mut h.events);

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.engine.heartbeat();
        h.engine.heartbeat();

        let evictions = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, ProtocolEvent::PeerEvicted { .. }))
            .count();
        assert_eq!(evictions, 1);
        assert!(h.engine.table.is_empty());
        assert!(stale.is_closed());
    }

    #[tokio::test]
    async fn heartbeat_reaches_live_peers() {
        let keys = KeyGenerator::seeded(44);
        let mut h = harness(&keys, ProtocolConfig::default());
        let local = h.engine.local;
        let (ours, theirs) = testutil::linked(local, keys.generate(), &TransportConfig::new());
        h.engine.admit(ours);

        h.engine.heartbeat();
        let msg = theirs.receive_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.payload(), &Payload::Heartbeat);
        assert_eq!(msg.source(), local);
    }

    #[tokio::test]
    async fn leader_answers_directly() {
        let keys = KeyGenerator::seeded(45);
        let config = ProtocolConfig {
            is_leader: true,
            ..ProtocolConfig::default()
        };
        let mut h = harness(&keys, config);
        let local = h.engine.local;
        let asker_key = keys.generate();
        let (ours, theirs) = testutil::linked(local, asker_key, &TransportConfig::new());
        h.engine.admit(ours.clone());

        let query = Message::new(&keys, asker_key, local, Payload::QueryLeader { hops: 7 });
        h.engine.dispatch(&ours, query).await;

        let reply = theirs.receive_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            reply.payload(),
            &Payload::LeaderReply {
                hops: 7,
                leader: Some(local)
            }
        );
    }

    #[tokio::test]
    async fn query_over_hop_bound_is_not_forwarded() {
        let keys = KeyGenerator::seeded(46);
        let mut h = harness(&keys, ProtocolConfig::default());
        let local = h.engine.local;
        let config = TransportConfig::new();

        let asker_key = keys.generate();
        let (asker, asker_remote) = testutil::linked(local, asker_key, &config);
        let (bystander, bystander_remote) = testutil::linked(local, keys.generate(), &config);
        h.engine.admit(asker.clone());
        h.engine.admit(bystander);

        let query = Message::new(&keys, asker_key, local, Payload::QueryLeader { hops: 4 });
        h.engine.dispatch(&asker, query).await;

        let reply = asker_remote.receive_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            reply.payload(),
            &Payload::LeaderReply {
                hops: 4,
                leader: None
            }
        );
        let err = bystander_remote
            .receive_message(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn query_is_forwarded_with_incremented_hops() {
        let keys = KeyGenerator::seeded(47);
        let config = ProtocolConfig {
            leader_reply_timeout: Duration::from_millis(500),
            ..ProtocolConfig::default()
        };
        let mut h = harness(&keys, config);
        let local = h.engine.local;
        let tc = TransportConfig::new();

        let asker_key = keys.generate();
        let leader_key = keys.generate();
        let (asker, asker_remote) = testutil::linked(local, asker_key, &tc);
        let (next, next_remote) = testutil::linked(local, leader_key, &tc);
        h.engine.admit(asker.clone());
        h.engine.admit(next);

        let remote_keys = keys.clone();
        tokio::spawn(async move {
            let fwd = next_remote.receive_message(Duration::from_secs(1)).await.unwrap();
            assert_eq!(fwd.payload(), &Payload::QueryLeader { hops: 2 });
            let reply = Message::new(
                &remote_keys,
                leader_key,
                fwd.source(),
                Payload::LeaderReply {
                    hops: 2,
                    leader: Some(leader_key),
                },
            );
            next_remote.send_message(reply, Duration::from_secs(1)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let query = Message::new(&keys, asker_key, local, Payload::QueryLeader { hops: 1 });
        h.engine.dispatch(&asker, query).await;

        let reply = asker_remote.receive_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            reply.payload(),
            &Payload::LeaderReply {
                hops: 1,
                leader: Some(leader_key)
            }
        );
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, ProtocolEvent::LeaderFound { leader } if *leader == leader_key)));
    }

    #[tokio::test]
    async fn data_arriving_during_a_forwarded_query_is_delivered() {
        let keys = KeyGenerator::seeded(53);
        let config = ProtocolConfig {
            leader_reply_timeout: Duration::from_millis(500),
            ..ProtocolConfig::default()
        };
        let mut h = harness(&keys, config);
        let local = h.engine.local;
        let tc = TransportConfig::new().requeue_capacity(4);

        let asker_key = keys.generate();
        let chatty_key = keys.generate();
        let (asker, asker_remote) = testutil::linked(local, asker_key, &tc);
        let (chatty, chatty_remote) = testutil::linked(local, chatty_key, &tc);
        h.engine.admit(asker.clone());
        h.engine.admit(chatty);

        let remote_keys = keys.clone();
        tokio::spawn(async move {
            let fwd = chatty_remote.receive_message(Duration::from_secs(1)).await.unwrap();
            assert!(matches!(fwd.payload(), Payload::QueryLeader { .. }));
            for i in 0..40u8 {
                let data = Message::new(&remote_keys, chatty_key, local, Payload::Data { body: vec![i] });
                chatty_remote.send_message(data, Duration::from_secs(1)).await.unwrap();
            }
            let reply = Message::new(
                &remote_keys,
                chatty_key,
                local,
                Payload::LeaderReply { hops: 1, leader: None },
            );
            chatty_remote.send_message(reply, Duration::from_secs(1)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let query = Message::new(&keys, asker_key, local, Payload::QueryLeader { hops: 0 });
        h.engine.dispatch(&asker, query).await;

        let reply = asker_remote.receive_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            reply.payload(),
            &Payload::LeaderReply {
                hops: 0,
                leader: None
            }
        );
        let mut bodies = Vec::new();
        while let Ok(got) = h.data.try_recv() {
            assert_eq!(got.from, chatty_key);
            bodies.push(got.body);
        }
        let expected: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i]).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn data_is_delivered() {
        let keys = KeyGenerator::seeded(48);
        let mut h = harness(&keys, ProtocolConfig::default());
        let local = h.engine.local;
        let sender = keys.generate();
        let (ours, _theirs) = testutil::linked(local, sender, &TransportConfig::new());

        let msg = Message::new(&keys, sender, local, Payload::Data { body: b"hi".to_vec() });
        let id = msg.id();
        h.engine.dispatch(&ours, msg).await;

        let got = h.data.try_recv().unwrap();
        assert_eq!(got.from, sender);
        assert_eq!(got.id, id);
        assert_eq!(got.body, b"hi".to_vec());
    }

    #[tokio::test]
    async fn send_data_to_unknown_peer_fails() {
        let keys = KeyGenerator::seeded(49);
        let h = harness(&keys, ProtocolConfig::default());
        let err = h.engine.send_data(keys.generate(), vec![1]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_intake_is_rejected_and_closed() {
        let keys = KeyGenerator::seeded(50);
        let mut h = harness(&keys, ProtocolConfig::default());
        let config = TransportConfig::new();
        let peer = keys.generate();

        let (first, _p1) = testutil::node(peer, Direction::Outbound, &config);
        let (second, _p2) = testutil::node(peer, Direction::Outbound, &config);
        h.engine.admit(first.clone());
        h.engine.admit(second.clone());

        assert!(!first.is_closed());
        assert!(second.is_closed());
        let events = drain(&mut h.events);
        assert!(matches!(events[0], ProtocolEvent::PeerAdded { .. }));
        assert!(matches!(events[1], ProtocolEvent::PeerRejected { .. }));
    }

    #[tokio::test]
    async fn gossip_tick_skips_when_worker_busy() {
        let keys = KeyGenerator::seeded(51);
        let mut h = harness(&keys, ProtocolConfig::default());
        let (a, _pa) = testutil::linked(h.engine.local, keys.generate(), &TransportConfig::new());

        // empty table: nothing queued
        h.engine.gossip();
        assert!(h.gossip_rx.try_recv().is_err());

        h.engine.admit(a);
        h.engine.gossip();
        h.engine.gossip();
        let round = h.gossip_rx.try_recv().unwrap();
        assert_eq!(round.peers.len(), 1);
        assert!(h.gossip_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn poll_dispatches_mailbox_traffic() {
        let keys = KeyGenerator::seeded(52);
        let config = ProtocolConfig {
            poll_timeout: Duration::from_millis(20),
            ..ProtocolConfig::default()
        };
        let mut h = harness(&keys, config);
        let local = h.engine.local;
        let sender = keys.generate();
        let (ours, theirs) = testutil::linked(local, sender, &TransportConfig::new());
        h.engine.admit(ours);

        let msg = Message::new(&keys, sender, local, Payload::Data { body: vec![7] });
        theirs.send_message(msg, Duration::from_secs(1)).await.unwrap();

        let mut delivered = None;
        for _ in 0..20 {
            h.engine.poll().await;
            if let Ok(got) = h.data.try_recv() {
                delivered = Some(got);
                break;
            }
        }
        assert_eq!(delivered.unwrap().body, vec![7]);
    }
}
