//! Consensus-replicated distributed log.
//!
//! Wraps the storage engine in a Raft-driven finite state machine and
//! exposes the cluster-facing API: leader appends, local reads, membership
//! changes, and leader discovery. One listening socket per node carries
//! both the consensus protocol and the record RPC protocol, demultiplexed
//! by a one-byte prefix (see [`stream_layer`]).
//!
//! ```text
//! append ──► DistributedLog ──► raft ──► every replica's LogFsm
//!                                              │
//!                                              ▼
//!                                          CommitLog
//! ```

pub mod command;
pub mod config;
pub mod distributed;
pub mod fsm;
pub mod log_store;
pub mod network;
pub mod replicator;
pub mod stream_layer;
pub mod types;

pub use command::{CommandResponse, LogCommand};
pub use config::RaftNodeConfig;
pub use distributed::{DistributedLog, Server};
pub use fsm::LogFsm;
pub use log_store::RaftLogStore;
pub use network::{RaftClient, RaftTransportService};
pub use replicator::Replicator;
pub use stream_layer::{MuxConnectInfo, PeerDialer, StreamLayer, RPC_LOG, RPC_RAFT};
pub use types::NodeId;

pub use logship_core::{Error, Result};
