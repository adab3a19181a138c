//! Error Types for Logship
//!
//! One shared error enum covers the storage engine and the cluster layer so
//! the capability traits in [`crate::traits`] can be implemented by both a
//! local commit log and a consensus-backed one.
//!
//! ## Error Categories
//!
//! ### Storage Errors
//! - `OffsetOutOfRange`: no segment covers the requested offset
//! - `SegmentMaxed`: the active segment cannot accept another record
//! - `IndexFull`: the mmapped index has no room for another entry
//! - `Eof`: an index read addressed an entry past the used prefix
//!
//! ### Cluster Errors
//! - `NotLeader`: the operation requires leadership; carries a hint to the
//!   current leader when one is known
//! - `Timeout`: consensus did not commit (or a leader did not emerge)
//!   within the configured window
//! - `Raft`: opaque consensus-internal failure
//! - `Transport`: dialing or speaking to a peer failed
//!
//! All fallible functions in the workspace return `Result<T>`, aliased to
//! `Result<T, Error>`, so `?` propagation works across crate boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },

    #[error("segment is maxed")]
    SegmentMaxed,

    #[error("index is full")]
    IndexFull,

    #[error("end of index")]
    Eof,

    #[error("not the leader{}", leader_hint.map(|id| format!(", leader is node {id}")).unwrap_or_default())]
    NotLeader { leader_hint: Option<u64> },

    #[error("timed out")]
    Timeout,

    #[error("raft error: {0}")]
    Raft(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True for the EOF-class errors the index reports when a read or
    /// write lands past the live prefix.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof | Error::IndexFull)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
