use std::fmt;
use std::time::Duration;

use crate::cipher::SECRET_LEN;

/// Pre-shared secret used when neither the builder nor `EPINET_SECRET` sets one.
pub const DEFAULT_SECRET: [u8; SECRET_LEN] = *b"hello world 1234";

/// A node with no inbound traffic for this long is no longer valid.
pub const NODE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on the whole three-message handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration shared by the listener, the bootstrap client and every
/// [`Node`](crate::Node) they produce.
///
/// ```rust
/// use std::time::Duration;
/// use epinet_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .secret(*b"0123456789abcdef")
///     .system_port(8080)
///     .node_timeout(Duration::from_secs(30));
/// ```
#[derive(Clone)]
pub struct TransportConfig {
    /// Symmetric AES-128 key shared by every peer.
    pub(crate) secret: [u8; SECRET_LEN],
    /// Port our listener accepts on, advertised during the handshake.
    /// Zero means "use whatever port the listener bound".
    pub(crate) system_port: u16,
    /// Liveness window for a node.
    pub(crate) node_timeout: Duration,
    /// Deadline for connect + handshake.
    pub(crate) handshake_timeout: Duration,
    /// Largest frame accepted or emitted, in bytes.
    pub(crate) max_frame_size: usize,
    /// Capacity of a node's requeue buffer.
    pub(crate) requeue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a config with defaults.
    ///
    /// If `EPINET_SECRET` is set to exactly 16 bytes it replaces the default
    /// secret. This can be overridden with [`.secret()`](Self::secret).
    pub fn new() -> Self {
        let secret = match std::env::var("EPINET_SECRET") {
            Ok(s) => match <[u8; SECRET_LEN]>::try_from(s.as_bytes()) {
                Ok(secret) => secret,
                Err(_) => {
                    tracing::warn!(
                        "EPINET_SECRET must be exactly {SECRET_LEN} bytes, using the default secret"
                    );
                    DEFAULT_SECRET
                }
            },
            Err(_) => DEFAULT_SECRET,
        };

        Self {
            secret,
            system_port: 0,
            node_timeout: NODE_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_frame_size: 1024 * 1024, // 1 MB
            requeue_capacity: 32,
        }
    }

    /// Set the pre-shared secret.
    pub fn secret(mut self, secret: [u8; SECRET_LEN]) -> Self {
        self.secret = secret;
        self
    }

    /// Set the advertised system port.
    pub fn system_port(mut self, port: u16) -> Self {
        self.system_port = port;
        self
    }

    /// Set the node liveness timeout (default: 15 s).
    pub fn node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Set the connect + handshake deadline (default: 10 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the maximum frame size (default: 1 MB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the requeue buffer capacity per node (default: 32).
    pub fn requeue_capacity(mut self, capacity: usize) -> Self {
        self.requeue_capacity = capacity;
        self
    }

    /// The advertised system port (0 until a listener has been bound).
    pub fn get_system_port(&self) -> u16 {
        self.system_port
    }

    /// The node liveness timeout.
    pub fn get_node_timeout(&self) -> Duration {
        self.node_timeout
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("secret", &"<redacted>")
            .field("system_port", &self.system_port)
            .field("node_timeout", &self.node_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("requeue_capacity", &self.requeue_capacity)
            .finish()
    }
}
