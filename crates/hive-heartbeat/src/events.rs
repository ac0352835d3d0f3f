//! Cluster events published by the heartbeat layer.

use hive_state::NodeName;

/// Capacity of the event broadcast channel. Slow subscribers lag and skip.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// `peer` started beating on `link`.
    PeerBeating { link: String, peer: NodeName },
    /// `peer` went silent on `link` for longer than its timeout.
    PeerStale { link: String, peer: NodeName },
    /// A full dataset from `peer` was installed.
    TopologyChanged { peer: NodeName },
}
