/// Messages exchanged between peers.
///
/// The envelope (source, desired, id, timestamp) is fixed at construction.
/// Arguments are carried as a closed [`Payload`] enum rather than an open
/// map: on the wire they still appear as a msgpack map under `args`, and
/// are decoded into the variant selected by the `command` tag.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cipher::{Iv, IV_LEN};
use crate::key::{Key, KeyGenerator};
use crate::TransportError;

// ── Command tags ─────────────────────────────────────────────────────────

pub const CMD_HANDSHAKE: &str = "handshake";
pub const CMD_ACK: &str = "ack";
pub const CMD_HEARTBEAT: &str = "heartbeat";
pub const CMD_GOSSIP: &str = "gossip";
pub const CMD_QUERY_LEADER: &str = "query_leader";
pub const CMD_LEADER_REPLY: &str = "leader_reply";
pub const CMD_DATA: &str = "data";

// ── PeerAdvert ───────────────────────────────────────────────────────────

/// One entry of a gossip list: who a peer is and where it accepts
/// connections.
///
/// Encoded as a 3-tuple `(key bytes, ip bytes, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAdvert {
    pub key: Key,
    pub addr: IpAddr,
    pub port: u16,
}

impl PeerAdvert {
    pub fn new(key: Key, addr: IpAddr, port: u16) -> Self {
        Self { key, addr, port }
    }

    /// Address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl Serialize for PeerAdvert {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ip = match self.addr {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        };
        (self.key, serde_bytes::Bytes::new(&ip), self.port).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PeerAdvert {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (key, ip, port) = <(Key, serde_bytes::ByteBuf, u16)>::deserialize(deserializer)?;
        let addr = match ip.len() {
            4 => {
                let octets: [u8; 4] = ip[..].try_into().map_err(serde::de::Error::custom)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = ip[..].try_into().map_err(serde::de::Error::custom)?;
                Ipv6Addr::from(octets).to_canonical()
            }
            n => {
                return Err(serde::de::Error::custom(format!(
                    "ip address must be 4 or 16 bytes, got {n}"
                )))
            }
        };
        Ok(Self { key, addr, port })
    }
}

// ── Payload ──────────────────────────────────────────────────────────────

/// Command-specific arguments, one variant per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Identity exchange. The listener's offer carries the connection IV;
    /// the dialer's reply does not.
    Handshake { iv: Option<Iv>, system_port: u16 },
    /// Final handshake message from the listener.
    Ack,
    /// Liveness signal.
    Heartbeat,
    /// Peers the sender currently tracks, excluding the recipient.
    Gossip { entries: Vec<PeerAdvert> },
    /// Asks whether any reachable peer is the leader.
    QueryLeader { hops: u32 },
    /// Answer to a [`Payload::QueryLeader`]; `leader` is set only on a
    /// positive answer.
    LeaderReply { hops: u32, leader: Option<Key> },
    /// Opaque application bytes.
    Data { body: Vec<u8> },
    /// A command this build does not recognise.
    Unknown { command: String },
}

impl Payload {
    /// The wire command tag for this payload.
    pub fn command(&self) -> &str {
        match self {
            Payload::Handshake { .. } => CMD_HANDSHAKE,
            Payload::Ack => CMD_ACK,
            Payload::Heartbeat => CMD_HEARTBEAT,
            Payload::Gossip { .. } => CMD_GOSSIP,
            Payload::QueryLeader { .. } => CMD_QUERY_LEADER,
            Payload::LeaderReply { .. } => CMD_LEADER_REPLY,
            Payload::Data { .. } => CMD_DATA,
            Payload::Unknown { command } => command,
        }
    }

    fn into_args(self) -> WireArgs {
        let mut args = WireArgs::default();
        match self {
            Payload::Handshake { iv, system_port } => {
                args.iv = iv.map(|iv| iv.to_vec());
                args.system_port = Some(system_port);
            }
            Payload::Gossip { entries } => args.gossip = Some(entries),
            Payload::QueryLeader { hops } => args.hops = Some(hops),
            Payload::LeaderReply { hops, leader } => {
                args.hops = Some(hops);
                args.leader = leader;
            }
            Payload::Data { body } => args.data = Some(body),
            Payload::Ack | Payload::Heartbeat | Payload::Unknown { .. } => {}
        }
        args
    }

    fn from_wire(command: String, args: WireArgs) -> Result<Self, TransportError> {
        let malformed = |command: &str, reason: &str| TransportError::MalformedPayload {
            command: command.to_string(),
            reason: reason.to_string(),
        };

        let payload = match command.as_str() {
            CMD_HANDSHAKE => {
                let system_port = args
                    .system_port
                    .ok_or_else(|| malformed(CMD_HANDSHAKE, "missing systemPort"))?;
                let iv = match args.iv {
                    Some(bytes) => Some(<Iv>::try_from(bytes.as_slice()).map_err(|_| {
                        malformed(
                            CMD_HANDSHAKE,
                            &format!("iv must be {IV_LEN} bytes, got {}", bytes.len()),
                        )
                    })?),
                    None => None,
                };
                Payload::Handshake { iv, system_port }
            }
            CMD_ACK => Payload::Ack,
            CMD_HEARTBEAT => Payload::Heartbeat,
            CMD_GOSSIP => Payload::Gossip {
                entries: args
                    .gossip
                    .ok_or_else(|| malformed(CMD_GOSSIP, "missing gossip list"))?,
            },
            CMD_QUERY_LEADER => Payload::QueryLeader {
                hops: args.hops.unwrap_or(0),
            },
            CMD_LEADER_REPLY => Payload::LeaderReply {
                hops: args.hops.unwrap_or(0),
                leader: args.leader.filter(|k| !k.is_null()),
            },
            CMD_DATA => Payload::Data {
                body: args.data.ok_or_else(|| malformed(CMD_DATA, "missing data"))?,
            },
            other => Payload::Unknown {
                command: other.to_string(),
            },
        };
        Ok(payload)
    }
}

// ── Wire representation ──────────────────────────────────────────────────

/// The `args` map as it appears on the wire. Unknown keys are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireArgs {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    iv: Option<Vec<u8>>,
    #[serde(rename = "systemPort", default, skip_serializing_if = "Option::is_none")]
    system_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gossip: Option<Vec<PeerAdvert>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hops: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    leader: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    data: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    source: Key,
    desired: Key,
    id: Key,
    command: String,
    timestamp: u64,
    #[serde(default)]
    args: WireArgs,
}

// ── Message ──────────────────────────────────────────────────────────────

/// A message between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    source: Key,
    desired: Key,
    id: Key,
    timestamp: u64,
    payload: Payload,
}

impl Message {
    /// Stamp the current time and a fresh random id.
    ///
    /// `desired` may be [`NULL_KEY`](crate::NULL_KEY) when the destination
    /// is not yet known.
    pub fn new(keys: &KeyGenerator, source: Key, desired: Key, payload: Payload) -> Self {
        Self {
            source,
            desired,
            id: keys.generate(),
            timestamp: now_ms(),
            payload,
        }
    }

    /// Sender identity.
    pub fn source(&self) -> Key {
        self.source
    }

    /// Identity the sender is trying to reach.
    pub fn desired(&self) -> Key {
        self.desired
    }

    /// Random message id.
    pub fn id(&self) -> Key {
        self.id
    }

    /// Creation time, Unix milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Command tag.
    pub fn command(&self) -> &str {
        self.payload.command()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Serialize to MessagePack with named fields.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let wire = WireMessage {
            source: self.source,
            desired: self.desired,
            id: self.id,
            command: self.command().to_string(),
            timestamp: self.timestamp,
            args: self.payload.clone().into_args(),
        };
        rmp_serde::to_vec_named(&wire).map_err(Into::into)
    }

    /// Deserialize from MessagePack, decoding `args` by the command tag.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        let wire: WireMessage = rmp_serde::from_slice(data)?;
        let payload = Payload::from_wire(wire.command, wire.args)?;
        Ok(Self {
            source: wire.source,
            desired: wire.desired,
            id: wire.id,
            timestamp: wire.timestamp,
            payload,
        })
    }
}

/// Current time in milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
