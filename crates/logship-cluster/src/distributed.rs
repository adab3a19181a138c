//! The consensus-driven public log API.

use crate::command::LogCommand;
use crate::config::RaftNodeConfig;
use crate::fsm::LogFsm;
use crate::log_store::RaftLogStore;
use crate::network::RaftClient;
use crate::stream_layer::PeerDialer;
use crate::types::{write_error, LogRaft, NodeId};
use bytes::Bytes;
use logship_core::{Error, LogReader, LogWriter, Record, Result};
use logship_storage::CommitLog;
use openraft::{BasicNode, SnapshotPolicy};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often `wait_for_leader` polls the engine's leader field.
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A cluster member as surfaced by [`DistributedLog::get_servers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: NodeId,
    pub rpc_addr: String,
    pub is_leader: bool,
}

/// A commit log replicated across a cluster.
///
/// Appends run through consensus on the leader; reads are served from the
/// local applied state of any replica and are not linearizable across the
/// cluster.
pub struct DistributedLog {
    node_id: NodeId,
    log: Arc<CommitLog>,
    raft: LogRaft,
    config: RaftNodeConfig,
}

impl DistributedLog {
    /// Bring up the node: commit log and raft log under `data_dir`, the
    /// state machine, and the consensus engine dialing peers through
    /// `dialer`. With `bootstrap` set, proposes the initial single-voter
    /// configuration (idempotent across restarts).
    pub async fn open(
        data_dir: impl AsRef<Path>,
        config: RaftNodeConfig,
        dialer: PeerDialer,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let log = Arc::new(CommitLog::open(data_dir.join("log"), config.log.clone())?);
        let log_store = RaftLogStore::open(data_dir.join("raft"))?;
        let fsm = Arc::new(LogFsm::new(Arc::clone(&log), data_dir.join("raft"))?);

        let raft_config = openraft::Config {
            cluster_name: "logship".to_string(),
            heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
            election_timeout_min: config.election_timeout.0.as_millis() as u64,
            election_timeout_max: config.election_timeout.1.as_millis() as u64,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_threshold),
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| Error::Config(e.to_string()))?,
        );

        let network = RaftClient::new(dialer);
        let raft = openraft::Raft::new(config.id, raft_config, network, log_store, fsm)
            .await
            .map_err(|e| Error::Raft(format!("starting raft: {e:?}")))?;

        let dlog = Self {
            node_id: config.id,
            log,
            raft,
            config,
        };

        if dlog.config.bootstrap {
            dlog.bootstrap().await?;
        }

        info!(
            id = dlog.node_id,
            addr = %dlog.config.advertise_addr,
            bootstrap = dlog.config.bootstrap,
            "distributed log open"
        );
        Ok(dlog)
    }

    /// Propose the initial configuration: this node as sole voter.
    async fn bootstrap(&self) -> Result<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: self.config.advertise_addr.clone(),
            },
        );

        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            // A restarted bootstrap node is already initialized.
            Err(openraft::error::RaftError::APIError(
                openraft::error::InitializeError::NotAllowed(_),
            )) => Ok(()),
            Err(e) => Err(Error::Raft(e.to_string())),
        }
    }

    /// Append a record through consensus. Leader only; fails with
    /// `NotLeader` elsewhere and `Timeout` when the command does not
    /// commit within the configured window.
    pub async fn append(&self, value: Bytes) -> Result<u64> {
        let write = self.raft.client_write(LogCommand::Append { value });
        let response = match tokio::time::timeout(self.config.commit_timeout, write).await {
            Err(_) => return Err(Error::Timeout),
            Ok(Err(e)) => return Err(write_error(e)),
            Ok(Ok(response)) => response,
        };

        if let Some(error) = response.data.error {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                error,
            )));
        }
        response
            .data
            .offset
            .ok_or_else(|| Error::Raft("apply returned no offset".to_string()))
    }

    /// Read from the locally applied state.
    pub fn read(&self, offset: u64) -> Result<Record> {
        self.log.read(offset)
    }

    /// Add `id` as a voting member reachable at `addr`. Leader only;
    /// idempotent when the member is already present with the same
    /// address.
    pub async fn join(&self, id: NodeId, addr: &str) -> Result<()> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config;

        let already_voter = membership.voter_ids().any(|v| v == id);
        let same_addr = membership
            .nodes()
            .any(|(node_id, node)| *node_id == id && node.addr == addr);
        if already_voter && same_addr {
            return Ok(());
        }

        self.raft
            .add_learner(
                id,
                BasicNode {
                    addr: addr.to_string(),
                },
                true,
            )
            .await
            .map_err(write_error)?;

        let mut voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;

        info!(id, addr, "server joined");
        Ok(())
    }

    /// Remove `id` from the cluster. Leader only; a no-op when the id is
    /// not a member.
    pub async fn leave(&self, id: NodeId) -> Result<()> {
        let metrics = self.raft.metrics().borrow().clone();
        let mut voters: BTreeSet<NodeId> = metrics.membership_config.voter_ids().collect();
        if !voters.remove(&id) {
            return Ok(());
        }

        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;

        info!(id, "server left");
        Ok(())
    }

    /// Block until some node is leader, polling every 250 ms; fails with
    /// `Timeout` when none emerges in time.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.raft.current_leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    /// The cluster membership, with the current leader flagged.
    pub async fn get_servers(&self) -> Vec<Server> {
        let leader = self.raft.current_leader().await;
        let metrics = self.raft.metrics().borrow().clone();
        metrics
            .membership_config
            .nodes()
            .map(|(id, node)| Server {
                id: *id,
                rpc_addr: node.addr.clone(),
                is_leader: leader == Some(*id),
            })
            .collect()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Handle for mounting the consensus transport service.
    pub fn raft(&self) -> LogRaft {
        self.raft.clone()
    }

    /// Lowest and highest offsets of the locally applied log.
    pub fn offsets(&self) -> (u64, u64) {
        (self.log.lowest_offset(), self.log.highest_offset())
    }

    /// Shut down consensus, then close the commit log.
    pub async fn close(&self) -> Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| Error::Raft(format!("shutdown: {e:?}")))?;
        self.log.close()
    }
}

#[async_trait::async_trait]
impl LogWriter for DistributedLog {
    async fn append(&self, value: Bytes) -> Result<u64> {
        DistributedLog::append(self, value).await
    }
}

#[async_trait::async_trait]
impl LogReader for DistributedLog {
    async fn read(&self, offset: u64) -> Result<Record> {
        DistributedLog::read(self, offset)
    }
}
