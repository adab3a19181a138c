//! Logship Protocol Buffer Definitions
//!
//! gRPC service and message types for the two protocols a logship node
//! speaks over its multiplexed listener:
//!
//! - **Log** (`logship.v1`): the record surface (`Append`, `Read`,
//!   `AppendStream`, `ReadStream`). Used by clients and by the replicator.
//! - **RaftTransport** (`logship.raft`): consensus RPCs between peers,
//!   carrying the consensus engine's serialized payloads as opaque bytes.

/// The record RPC surface.
pub mod v1 {
    tonic::include_proto!("logship.v1");
}

/// Consensus transport carriers.
pub mod raft {
    tonic::include_proto!("logship.raft");
}
