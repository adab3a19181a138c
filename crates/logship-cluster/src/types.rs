//! Type configuration for the consensus engine.
//!
//! OpenRaft is parameterized over the application's command and response
//! types; everything else (node id, node record, entry, snapshot data)
//! takes the engine defaults. The aliases keep the rest of the crate free
//! of generic noise.

use std::io::Cursor;

use crate::command::{CommandResponse, LogCommand};
use logship_core::Error;
use openraft::BasicNode;

/// Unique 64-bit identifier of a cluster member.
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Raft type configuration for the replicated log.
    pub TypeConfig:
        D = LogCommand,
        R = CommandResponse,
);

pub type LogRaft = openraft::Raft<TypeConfig>;
pub type LogEntry = openraft::Entry<TypeConfig>;
pub type LogVote = openraft::Vote<NodeId>;
pub type RaftLogId = openraft::LogId<NodeId>;
pub type LogMembership = openraft::StoredMembership<NodeId, BasicNode>;
pub type LogSnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;
pub type LogSnapshot = openraft::storage::Snapshot<TypeConfig>;
pub type StorageError = openraft::StorageError<NodeId>;

pub type ClientWriteError = openraft::error::ClientWriteError<NodeId, BasicNode>;
pub type RaftWriteError = openraft::error::RaftError<NodeId, ClientWriteError>;

/// Collapse a consensus write error into the crate error model: a
/// forward-to-leader rejection becomes `NotLeader` with the hint the
/// engine knows, anything else is an opaque raft failure.
pub(crate) fn write_error(e: RaftWriteError) -> Error {
    match &e {
        openraft::error::RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
            Error::NotLeader {
                leader_hint: forward.leader_id,
            }
        }
        _ => Error::Raft(e.to_string()),
    }
}
