use std::time::Duration;

/// Send a heartbeat to every peer this often, sweeping dead ones first.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Hand a gossip round to the worker this often.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(10);

/// Queries with more hops than this get a negative answer.
pub const MAX_LEADER_HOPS: u32 = 3;

/// How long a forwarded leader query waits for replies.
pub const LEADER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the protocol engine.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Interval for the heartbeat sweep.
    pub heartbeat_interval: Duration,
    /// Interval for gossip rounds.
    pub gossip_interval: Duration,
    /// Interval between mailbox polling passes.
    pub poll_interval: Duration,
    /// Per-peer receive timeout inside one polling pass.
    pub poll_timeout: Duration,
    /// Send timeout for heartbeats.
    pub heartbeat_send_timeout: Duration,
    /// Send timeout for gossip messages.
    pub gossip_send_timeout: Duration,
    /// Send timeout for application data and leader traffic.
    pub data_send_timeout: Duration,
    /// Hop bound for leader queries.
    pub max_leader_hops: u32,
    /// Reply window for a forwarded leader query.
    pub leader_reply_timeout: Duration,
    /// Whether this node starts out as the leader.
    pub is_leader: bool,
    /// Capacity of the command, event and data channels.
    pub channel_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            gossip_interval: GOSSIP_INTERVAL,
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(1),
            heartbeat_send_timeout: Duration::from_secs(1),
            gossip_send_timeout: Duration::from_secs(1),
            data_send_timeout: Duration::from_secs(1),
            max_leader_hops: MAX_LEADER_HOPS,
            leader_reply_timeout: LEADER_REPLY_TIMEOUT,
            is_leader: false,
            channel_capacity: 64,
        }
    }
}
