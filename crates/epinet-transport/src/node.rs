use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cipher::{DecryptingReader, EncryptingWriter, SessionKeys};
use crate::config::TransportConfig;
use crate::framing;
use crate::key::Key;
use crate::message::{Message, PeerAdvert};
use crate::TransportError;

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

/// Everything a completed handshake hands to [`Node::spawn`].
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: Key,
    pub peer_system_port: u16,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub keys: SessionKeys,
}

/// One live, encrypted connection to one remote peer.
///
/// Cheap to clone; all clones share the same connection. A send loop and a
/// receive loop run in the background from [`Node::spawn`] until the
/// connection fails or [`Node::close`] is called. Once closed a node stays
/// invalid for good.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: Key,
    remote_addr: SocketAddr,
    system_port: u16,
    direction: Direction,
    keys: SessionKeys,
    timeout: Duration,

    last_seen: Mutex<Instant>,
    closed: AtomicBool,
    shutdown: CancellationToken,

    /// Taken on close, which ends the send loop.
    outbox: Mutex<Option<mpsc::Sender<Message>>>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    requeued: Mutex<VecDeque<Message>>,
    requeue_capacity: usize,

    /// Neighbours of this peer, for closest-peer queries. Held weakly: a
    /// neighbour list never keeps a connection alive.
    peers: Mutex<Vec<Neighbour>>,
}

/// Weak entry in a node's neighbour list.
struct Neighbour {
    id: Key,
    node: Weak<NodeInner>,
}

impl Neighbour {
    fn upgrade(&self) -> Option<Node> {
        self.node.upgrade().map(|inner| Node { inner })
    }

    fn is_alive(&self) -> bool {
        self.node.strong_count() > 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl NodeInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn touch(&self) {
        if !self.is_closed() {
            *lock(&self.last_seen) = Instant::now();
        }
    }

    /// Returns `true` only for the call that actually closed the node.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.cancel();
        lock(&self.outbox).take();
        lock(&self.peers).clear();
        true
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Node {
    /// Wrap a handshaken stream in the session cipher and start the I/O
    /// loops.
    pub fn spawn<S>(session: Session, stream: S, config: &TransportConfig) -> Node
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = DecryptingReader::new(read_half, &session.keys);
        let writer = EncryptingWriter::new(write_half, &session.keys);

        let (out_tx, out_rx) = mpsc::channel(1);
        let (in_tx, in_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(NodeInner {
            id: session.peer,
            remote_addr: session.remote_addr,
            system_port: session.peer_system_port,
            direction: session.direction,
            keys: session.keys,
            timeout: config.node_timeout,
            last_seen: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            outbox: Mutex::new(Some(out_tx)),
            inbox: tokio::sync::Mutex::new(in_rx),
            requeued: Mutex::new(VecDeque::new()),
            requeue_capacity: config.requeue_capacity,
            peers: Mutex::new(Vec::new()),
        });

        let max = config.max_frame_size;
        tokio::spawn(send_loop(
            Arc::downgrade(&inner),
            session.peer,
            writer,
            out_rx,
            max,
        ));
        tokio::spawn(recv_loop(
            Arc::downgrade(&inner),
            session.peer,
            reader,
            in_tx,
            shutdown,
            max,
        ));

        tracing::debug!(
            peer = %session.peer,
            remote = %session.remote_addr,
            direction = ?session.direction,
            "node started"
        );
        Node { inner }
    }

    // ── Identity ─────────────────────────────────────────────────────────

    /// The remote peer's key.
    pub fn id(&self) -> Key {
        self.inner.id
    }

    /// Socket address of the remote end of this connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Remote IP and port of this connection.
    pub fn host_port(&self) -> (IpAddr, u16) {
        (self.inner.remote_addr.ip(), self.inner.remote_addr.port())
    }

    /// Port the remote accepts new connections on.
    pub fn system_port(&self) -> u16 {
        self.inner.system_port
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Cipher key and IV of this connection.
    pub fn session_keys(&self) -> &SessionKeys {
        &self.inner.keys
    }

    /// How other peers can reach this one: key, IP, system port.
    pub fn advert(&self) -> PeerAdvert {
        PeerAdvert::new(
            self.inner.id,
            self.inner.remote_addr.ip().to_canonical(),
            self.inner.system_port,
        )
    }

    /// Whether two handles refer to the same connection.
    pub fn same_connection(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    /// Not closed, and heard from within the node timeout.
    pub fn is_valid(&self) -> bool {
        !self.inner.is_closed() && lock(&self.inner.last_seen).elapsed() <= self.inner.timeout
    }

    /// Reset the liveness clock. No effect on a closed node.
    pub fn refresh(&self) {
        self.inner.touch();
    }

    /// Time since traffic was last seen.
    pub fn idle_for(&self) -> Duration {
        lock(&self.inner.last_seen).elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Tear the connection down. Idempotent and safe to race with the
    /// receive loop noticing end of stream.
    pub fn close(&self) {
        if self.inner.close() {
            tracing::debug!(peer = %self.inner.id, "node closed");
        }
    }

    // ── Neighbours ───────────────────────────────────────────────────────

    /// XOR distance between this peer and `key`.
    pub fn distance_from(&self, key: &Key) -> Key {
        self.inner.id.xor(key)
    }

    /// Record `peer` as a neighbour. Entries whose connection has been
    /// dropped are pruned on the way.
    pub fn add_peer(&self, peer: Node) -> Result<(), TransportError> {
        let mut peers = lock(&self.inner.peers);
        peers.retain(Neighbour::is_alive);
        if peers.iter().any(|p| p.id == peer.id()) {
            return Err(TransportError::PeerAlreadyKnown(peer.id()));
        }
        peers.push(Neighbour {
            id: peer.id(),
            node: Arc::downgrade(&peer.inner),
        });
        Ok(())
    }

    pub fn get_peer(&self, key: &Key) -> Result<Node, TransportError> {
        lock(&self.inner.peers)
            .iter()
            .find(|p| p.id == *key)
            .and_then(Neighbour::upgrade)
            .ok_or(TransportError::PeerNotFound(*key))
    }

    pub fn remove_peer(&self, key: &Key) -> Result<Node, TransportError> {
        let mut peers = lock(&self.inner.peers);
        let idx = peers
            .iter()
            .position(|p| p.id == *key)
            .ok_or(TransportError::PeerNotFound(*key))?;
        peers
            .swap_remove(idx)
            .upgrade()
            .ok_or(TransportError::PeerNotFound(*key))
    }

    /// Neighbours whose connection is still referenced somewhere.
    pub fn peer_count(&self) -> usize {
        lock(&self.inner.peers)
            .iter()
            .filter(|p| p.is_alive())
            .count()
    }

    /// Up to `k` neighbours, nearest to this peer by XOR distance first.
    pub fn closest_peers(&self, k: usize) -> Vec<Node> {
        let own = self.inner.id;
        let mut peers: Vec<Node> = lock(&self.inner.peers)
            .iter()
            .filter_map(Neighbour::upgrade)
            .collect();
        peers.sort_by_key(|p| p.id().xor(&own));
        peers.truncate(k);
        peers
    }

    // ── Mailboxes ────────────────────────────────────────────────────────

    /// Hand a message to the send loop, waiting up to `timeout` for the
    /// single outbox slot.
    pub async fn send_message(&self, msg: Message, timeout: Duration) -> Result<(), TransportError> {
        if !self.is_valid() {
            return Err(TransportError::PeerNotFound(self.inner.id));
        }
        let Some(outbox) = lock(&self.inner.outbox).clone() else {
            return Err(TransportError::NodeClosed(self.inner.id));
        };

        match tokio::time::timeout(timeout, outbox.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NodeClosed(self.inner.id)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Next inbound message, requeued ones first.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrives in time and
    /// [`TransportError::NodeClosed`] once the connection is gone and the
    /// mailbox is drained.
    pub async fn receive_message(&self, timeout: Duration) -> Result<Message, TransportError> {
        if let Some(msg) = lock(&self.inner.requeued).pop_front() {
            return Ok(msg);
        }

        let next = tokio::time::timeout(timeout, async {
            let mut inbox = self.inner.inbox.lock().await;
            inbox.recv().await
        })
        .await;

        match next {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TransportError::NodeClosed(self.inner.id)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Put a message back so the next [`receive_message`](Self::receive_message)
    /// returns it ahead of live traffic.
    pub fn requeue_message(&self, msg: Message) -> Result<(), TransportError> {
        let mut requeued = lock(&self.inner.requeued);
        if requeued.len() >= self.inner.requeue_capacity {
            return Err(TransportError::RequeueFull {
                capacity: self.inner.requeue_capacity,
            });
        }
        requeued.push_back(msg);
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("system_port", &self.inner.system_port)
            .field("direction", &self.inner.direction)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

// ── I/O loops ────────────────────────────────────────────────────────────

async fn send_loop<W>(
    node: Weak<NodeInner>,
    peer: Key,
    mut writer: EncryptingWriter<W>,
    mut outbox: mpsc::Receiver<Message>,
    max_frame_size: usize,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbox.recv().await {
        match framing::write_frame(&mut writer, &msg, max_frame_size).await {
            Ok(()) => {
                tracing::trace!(%peer, command = msg.command(), "sent");
            }
            // Rejected before any byte hit the wire; the stream is intact.
            Err(e @ (TransportError::FrameTooLarge { .. } | TransportError::Serialization(_))) => {
                tracing::warn!(%peer, command = msg.command(), error = %e, "dropping outbound message");
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "write failed, closing node");
                if let Some(inner) = node.upgrade() {
                    inner.close();
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    tracing::trace!(%peer, "send loop finished");
}

async fn recv_loop<R>(
    node: Weak<NodeInner>,
    peer: Key,
    mut reader: DecryptingReader<R>,
    inbox: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    max_frame_size: usize,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framing::read_frame(&mut reader, max_frame_size) => frame,
        };

        let data = match frame {
            Ok(data) => data,
            Err(TransportError::EndOfStream) => {
                tracing::debug!(%peer, "peer closed the connection");
                close_weak(&node);
                break;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "read failed, closing node");
                close_weak(&node);
                break;
            }
        };

        let msg = match Message::from_bytes(&data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "skipping undecodable frame");
                continue;
            }
        };

        match node.upgrade() {
            Some(inner) => inner.touch(),
            None => break,
        }
        tracing::trace!(%peer, command = msg.command(), "received");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = inbox.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::trace!(%peer, "receive loop finished");
}

fn close_weak(node: &Weak<NodeInner>) {
    if let Some(inner) = node.upgrade() {
        inner.close();
    }
}
