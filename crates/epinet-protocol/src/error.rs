use epinet_transport::{Key, TransportError};

/// Protocol-level errors for epinet.
///
/// Wraps transport errors and adds the peer-table and engine variants.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("peer already known: {0}")]
    PeerAlreadyKnown(Key),

    #[error("peer not found: {0}")]
    PeerNotFound(Key),

    #[error("invalid peer {key}: {reason}")]
    InvalidPeer { key: Key, reason: String },

    #[error("protocol engine shut down")]
    Shutdown,
}
