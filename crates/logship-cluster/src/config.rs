//! Cluster node configuration.

use crate::types::NodeId;
use std::time::Duration;

/// Configuration for one consensus-backed log node.
#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    /// This node's unique id in the cluster.
    pub id: NodeId,

    /// Address peers dial to reach this node's multiplexed listener.
    pub advertise_addr: String,

    /// Propose the initial single-voter configuration containing this
    /// node. Exactly one node of a fresh cluster sets this.
    pub bootstrap: bool,

    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Election timeout range; a random point in it is drawn per election.
    pub election_timeout: (Duration, Duration),

    /// How long an append may wait on consensus before failing with
    /// `Timeout`.
    pub commit_timeout: Duration,

    /// Take a snapshot after this many entries since the last one.
    pub snapshot_threshold: u64,

    /// Storage-engine configuration for the replicated commit log.
    pub log: logship_core::Config,
}

impl Default for RaftNodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            advertise_addr: String::new(),
            bootstrap: false,
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: (Duration::from_millis(150), Duration::from_millis(300)),
            commit_timeout: Duration::from_secs(10),
            snapshot_threshold: 8192,
            log: logship_core::Config::default(),
        }
    }
}
