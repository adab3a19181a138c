//! Capability contracts between the RPC surface and the log.
//!
//! The gRPC server calls into the log, and the consensus-backed log is in
//! turn driven by RPCs. These two narrow traits break that cycle: the
//! server is constructed against a writer and a reader, never against a
//! concrete log type. Both the local `CommitLog` and the replicated
//! `DistributedLog` implement them.

use crate::{Record, Result};
use bytes::Bytes;

/// Appends records to a log.
#[async_trait::async_trait]
pub trait LogWriter: Send + Sync {
    /// Append `value` and return the offset it was assigned.
    async fn append(&self, value: Bytes) -> Result<u64>;
}

/// Reads records from a log by offset.
#[async_trait::async_trait]
pub trait LogReader: Send + Sync {
    /// Read the record at `offset`.
    async fn read(&self, offset: u64) -> Result<Record>;
}
