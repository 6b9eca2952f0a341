use crate::handshake::HandshakeStep;
use crate::Key;

/// Errors returned by the epinet transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake {step} failed: {reason}")]
    Handshake { step: HandshakeStep, reason: String },

    #[error("peer already known: {0}")]
    PeerAlreadyKnown(Key),

    #[error("peer not found: {0}")]
    PeerNotFound(Key),

    #[error("request timed out")]
    Timeout,

    #[error("node {0} is closed")]
    NodeClosed(Key),

    #[error("requeue buffer full ({capacity} messages)")]
    RequeueFull { capacity: usize },

    #[error("end of stream")]
    EndOfStream,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("message serialization failed: {0}")]
    Serialization(String),

    #[error("message deserialization failed: {0}")]
    Deserialization(String),

    #[error("malformed {command} payload: {reason}")]
    MalformedPayload { command: String, reason: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransportError::Deserialization(e.to_string())
    }
}
