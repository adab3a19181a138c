//! Replicated commands and their results.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A command carried through consensus. Appending a record is the only
/// operation the replicated state machine recognizes; the consensus state
/// is exactly the sequence of applied append commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogCommand {
    Append { value: Bytes },
}

/// Result of applying one command, returned to the caller on the leader
/// through the consensus future. Followers discard it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Offset assigned to the appended record.
    pub offset: Option<u64>,

    /// Apply-side failure, surfaced to the leader's append caller.
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn offset(offset: u64) -> Self {
        Self {
            offset: Some(offset),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            offset: None,
            error: Some(error.into()),
        }
    }
}
