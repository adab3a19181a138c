//! Segmented commit-log storage engine.
//!
//! A log is an ordered collection of segments; each segment pairs a store
//! file (length-prefixed record payloads) with an mmapped index file
//! (fixed-width offset-to-position entries). Appends go to the active
//! segment and roll into a fresh one when it fills; reads resolve the
//! owning segment by offset.
//!
//! Layout of a log directory:
//!
//! ```text
//! <dir>/
//! ├── 00000000000000000000.store
//! ├── 00000000000000000000.index
//! ├── 00000000000000000016.store
//! └── 00000000000000000016.index
//! ```
//!
//! File names carry the segment's base offset zero-padded to 20 digits.
//! There is no manifest; the segment set is recovered by enumerating the
//! directory.

pub mod codec;
pub mod index;
pub mod log;
pub mod segment;
pub mod store;

pub use index::Index;
pub use log::{CommitLog, LogBytesReader};
pub use logship_core::{Config, Error, Record, Result};
pub use segment::Segment;
pub use store::Store;
