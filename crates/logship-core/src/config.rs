//! Log configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a commit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub segment: SegmentConfig,
}

/// Per-segment limits and the base offset of a fresh log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Cap on a segment's store file, in bytes (length prefixes included).
    pub max_store_bytes: u64,

    /// Cap on a segment's index file, in bytes. Effectively rounded down
    /// to a multiple of the 12-byte entry width.
    pub max_index_bytes: u64,

    /// Base offset of the first segment of a fresh log.
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}
