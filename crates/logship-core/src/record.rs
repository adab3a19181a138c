//! Record Data Structure
//!
//! A record is the unit of data in a logship log: an opaque byte payload
//! plus the offset the log assigned to it. Offsets are dense and start at
//! the log's initial offset; they never skip or repeat for the lifetime of
//! a log.
//!
//! Uses `bytes::Bytes` for the payload so records can be cloned and sliced
//! without copying.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single record in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Offset assigned by the log.
    pub offset: u64,

    /// Opaque payload.
    pub value: Bytes,
}

impl Record {
    pub fn new(offset: u64, value: Bytes) -> Self {
        Self { offset, value }
    }
}
