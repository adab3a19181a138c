//! A segment ties one store and one index together under a base offset.

use crate::codec::ENT_WIDTH;
use crate::{Index, Store};
use logship_core::{Config, Error, Record, Result};
use std::path::Path;
use std::sync::Arc;

pub struct Segment {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: Config,
}

impl Segment {
    /// Open or create the segment with the given base offset inside `dir`.
    ///
    /// `next_offset` is derived from the index: an empty index means the
    /// segment restarts at its base; otherwise it continues one past the
    /// last relative offset on record.
    pub fn open(dir: &Path, base_offset: u64, config: Config) -> Result<Self> {
        let store = Arc::new(Store::open(dir.join(format!("{base_offset:020}.store")))?);
        let index = Index::open(
            dir.join(format!("{base_offset:020}.index")),
            config.segment.max_index_bytes,
        )?;

        let next_offset = match index.read(-1) {
            Ok((rel_off, _)) => base_offset + u64::from(rel_off) + 1,
            Err(e) if e.is_eof() => base_offset,
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Append a record payload, returning its absolute offset. Fails with
    /// `SegmentMaxed` when either backing file is out of room; the caller
    /// rolls to a new segment.
    pub fn append(&mut self, value: &[u8]) -> Result<u64> {
        if self.is_maxed() {
            return Err(Error::SegmentMaxed);
        }

        let offset = self.next_offset;
        let (_, pos) = self.store.append(value)?;

        match self.index.write((offset - self.base_offset) as u32, pos) {
            Ok(()) => {}
            Err(e) if e.is_eof() => return Err(Error::SegmentMaxed),
            Err(e) => return Err(e),
        }

        self.next_offset += 1;
        Ok(offset)
    }

    /// Read the record at an absolute offset.
    pub fn read(&self, offset: u64) -> Result<Record> {
        if offset < self.base_offset || offset >= self.next_offset {
            return Err(Error::OffsetOutOfRange { offset });
        }

        let rel = offset - self.base_offset;
        let (_, pos) = match self.index.read(rel as i64) {
            Ok(entry) => entry,
            Err(e) if e.is_eof() => return Err(Error::OffsetOutOfRange { offset }),
            Err(e) => return Err(e),
        };

        let value = self.store.read(pos)?;
        Ok(Record::new(offset, value))
    }

    /// Whether either backing file has reached its configured cap.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.segment.max_store_bytes
            || self.index.size() + ENT_WIDTH > self.config.segment.max_index_bytes
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Shared handle to the backing store, for the log-wide byte reader.
    pub(crate) fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub(crate) fn store_size(&self) -> u64 {
        self.store.size()
    }

    /// Close index then store.
    pub fn close(&self) -> Result<()> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Close and delete both backing files.
    pub fn remove(self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(self.index.path())?;
        std::fs::remove_file(self.store.path())?;
        Ok(())
    }
}
