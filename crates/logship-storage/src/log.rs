//! The commit log: an ordered collection of segments.

use crate::Segment;
use bytes::Bytes;
use logship_core::{Config, Error, LogReader, LogWriter, Record, Result};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Append-only log of opaque records, durably persisted as segment file
/// pairs under one directory.
///
/// Base offsets are strictly increasing, consecutive segments meet exactly
/// (`segments[i + 1].base_offset == segments[i].next_offset`), and only the
/// last segment accepts appends.
pub struct CommitLog {
    dir: PathBuf,
    config: Config,
    segments: RwLock<Vec<Segment>>,
}

impl CommitLog {
    /// Open the log in `dir`, recovering any segments already on disk.
    /// A fresh directory gets one empty segment at the configured initial
    /// offset.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let segments = Self::load_segments(&dir, &config)?;
        info!(dir = %dir.display(), segments = segments.len(), "commit log opened");

        Ok(Self {
            dir,
            config,
            segments: RwLock::new(segments),
        })
    }

    fn load_segments(dir: &Path, config: &Config) -> Result<Vec<Segment>> {
        // There is no manifest: every `<base>.store` / `<base>.index` pair
        // contributes its base offset once.
        let mut bases = BTreeSet::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if ext != "store" && ext != "index" {
                continue;
            }
            if let Some(base) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                bases.insert(base);
            }
        }

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in bases {
            segments.push(Segment::open(dir, base, config.clone())?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(
                dir,
                config.segment.initial_offset,
                config.clone(),
            )?);
        }
        Ok(segments)
    }

    /// Append a record value, returning its offset. Rolls to a new segment
    /// when the active one is out of room; `SegmentMaxed` never escapes.
    pub fn append(&self, value: &[u8]) -> Result<u64> {
        let mut segments = self.segments.write();

        let active = segments
            .last_mut()
            .expect("commit log always holds an active segment");
        let offset = match active.append(value) {
            Ok(offset) => offset,
            Err(Error::SegmentMaxed) => {
                let base = active.next_offset();
                debug!(base, "active segment maxed, rotating");
                segments.push(Segment::open(&self.dir, base, self.config.clone())?);
                segments
                    .last_mut()
                    .expect("segment was just pushed")
                    .append(value)?
            }
            Err(e) => return Err(e),
        };

        // Roll eagerly once full so the next append lands in a fresh
        // segment without taking the error path.
        let active = segments
            .last()
            .expect("commit log always holds an active segment");
        if active.is_maxed() {
            let base = active.next_offset();
            debug!(base, "active segment maxed, rotating");
            segments.push(Segment::open(&self.dir, base, self.config.clone())?);
        }

        Ok(offset)
    }

    /// Read the record at `offset` from the segment that owns it.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let segments = self.segments.read();
        let segment = segments
            .iter()
            .find(|s| s.base_offset() <= offset && offset < s.next_offset())
            .ok_or(Error::OffsetOutOfRange { offset })?;
        segment.read(offset)
    }

    /// Base offset of the oldest segment.
    pub fn lowest_offset(&self) -> u64 {
        let segments = self.segments.read();
        segments.first().map(|s| s.base_offset()).unwrap_or(0)
    }

    /// Offset of the newest record, or 0 when the log is empty.
    pub fn highest_offset(&self) -> u64 {
        let segments = self.segments.read();
        match segments.last().map(|s| s.next_offset()).unwrap_or(0) {
            0 => 0,
            next => next - 1,
        }
    }

    /// Drop every segment whose records all lie at or below `lowest`,
    /// deleting their files. When that removes everything, a fresh active
    /// segment is created at the old head so the next append continues at
    /// the same offset.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut segments = self.segments.write();

        let mut kept = Vec::with_capacity(segments.len());
        let mut next_base = self.config.segment.initial_offset;
        for segment in segments.drain(..) {
            if segment.next_offset() <= lowest + 1 {
                next_base = segment.next_offset();
                debug!(base = segment.base_offset(), "removing truncated segment");
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        if kept.is_empty() {
            kept.push(Segment::open(&self.dir, next_base, self.config.clone())?);
        }
        *segments = kept;
        Ok(())
    }

    /// A reader over the raw store frames of every segment, in offset
    /// order. This is the byte stream snapshots carry.
    pub fn reader(&self) -> LogBytesReader {
        let segments = self.segments.read();
        LogBytesReader {
            stores: segments
                .iter()
                .map(|s| (s.store(), s.store_size()))
                .collect(),
            current: 0,
            pos: 0,
        }
    }

    /// Close every segment, flushing stores and truncating indexes.
    pub fn close(&self) -> Result<()> {
        let segments = self.segments.write();
        for segment in segments.iter() {
            segment.close()?;
        }
        Ok(())
    }

    /// Remove all data and reopen empty at the configured initial offset.
    pub fn reset(&self) -> Result<()> {
        let mut segments = self.segments.write();
        info!(dir = %self.dir.display(), "resetting commit log");
        for segment in segments.drain(..) {
            segment.remove()?;
        }
        segments.push(Segment::open(
            &self.dir,
            self.config.segment.initial_offset,
            self.config.clone(),
        )?);
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogWriter for CommitLog {
    async fn append(&self, value: Bytes) -> Result<u64> {
        CommitLog::append(self, &value)
    }
}

#[async_trait::async_trait]
impl LogReader for CommitLog {
    async fn read(&self, offset: u64) -> Result<Record> {
        CommitLog::read(self, offset)
    }
}

/// Chains every segment store's bytes into one `Read`, frame format
/// included. Sizes are snapshotted at creation, so concurrent appends
/// after the fact are not observed.
pub struct LogBytesReader {
    stores: Vec<(Arc<crate::Store>, u64)>,
    current: usize,
    pos: u64,
}

impl Read for LogBytesReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some((store, size)) = self.stores.get(self.current) else {
                return Ok(0);
            };
            if self.pos >= *size {
                self.current += 1;
                self.pos = 0;
                continue;
            }

            let want = buf.len().min((size - self.pos) as usize);
            let n = store
                .read_at(&mut buf[..want], self.pos)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            if n == 0 {
                self.current += 1;
                self.pos = 0;
                continue;
            }

            self.pos += n as u64;
            return Ok(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ENT_WIDTH, LEN_WIDTH};

    use tempfile::TempDir;

    fn small_config() -> Config {
        let mut config = Config::default();
        // Three records of "hello world" per segment.
        config.segment.max_index_bytes = ENT_WIDTH * 3;
        config
    }

    #[test]
    fn test_append_read() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), Config::default()).unwrap();

        for i in 0..4u64 {
            assert_eq!(log.append(b"hello world").unwrap(), i);
            let got = log.read(i).unwrap();
            assert_eq!(got.offset, i);
            assert_eq!(got.value, Bytes::from_static(b"hello world"));
        }
    }

    #[test]
    fn test_offset_out_of_range() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), Config::default()).unwrap();
        log.append(b"only").unwrap();

        assert!(matches!(
            log.read(1),
            Err(Error::OffsetOutOfRange { offset: 1 })
        ));
    }

    #[test]
    fn test_rotation_across_segments() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();

        for i in 0..7u64 {
            assert_eq!(log.append(b"hello world").unwrap(), i);
        }

        // Reads keep working across the segment boundaries.
        for i in 0..7u64 {
            assert_eq!(log.read(i).unwrap().offset, i);
        }
        assert!(dir.path().join("00000000000000000003.store").exists());
    }

    #[test]
    fn test_reopen_recovers_state() {
        let dir = TempDir::new().unwrap();

        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        for _ in 0..5 {
            log.append(b"hello world").unwrap();
        }
        assert_eq!(log.highest_offset(), 4);
        log.close().unwrap();
        drop(log);

        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 4);
        for i in 0..5u64 {
            assert_eq!(log.read(i).unwrap().value, Bytes::from_static(b"hello world"));
        }
        assert_eq!(log.append(b"hello world").unwrap(), 5);
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        for _ in 0..9 {
            log.append(b"hello world").unwrap();
        }

        log.truncate(5).unwrap();

        assert!(matches!(log.read(2), Err(Error::OffsetOutOfRange { .. })));
        assert_eq!(log.read(6).unwrap().offset, 6);
        assert_eq!(log.lowest_offset(), 6);
    }

    #[test]
    fn test_truncate_everything_restarts_at_old_head() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        for _ in 0..6 {
            log.append(b"hello world").unwrap();
        }

        // Every segment falls at or below the truncation point; a fresh
        // one takes over at the old head.
        log.truncate(20).unwrap();

        assert_eq!(log.lowest_offset(), 6);
        assert!(matches!(log.read(5), Err(Error::OffsetOutOfRange { .. })));
        assert_eq!(log.append(b"resumed").unwrap(), 6);
        assert_eq!(log.read(6).unwrap().value, Bytes::from_static(b"resumed"));
    }

    #[test]
    fn test_reader_streams_all_frames() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        for _ in 0..5 {
            log.append(b"hello world").unwrap();
        }

        let mut bytes = Vec::new();
        log.reader().read_to_end(&mut bytes).unwrap();

        let frame = LEN_WIDTH as usize + "hello world".len();
        assert_eq!(bytes.len(), frame * 5);
        // First frame decodes back to the record value.
        assert_eq!(&bytes[LEN_WIDTH as usize..frame], b"hello world");
    }

    #[test]
    fn test_reset() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), small_config()).unwrap();
        for _ in 0..5 {
            log.append(b"hello world").unwrap();
        }

        log.reset().unwrap();

        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 0);
        assert!(matches!(log.read(0), Err(Error::OffsetOutOfRange { .. })));
        assert_eq!(log.append(b"fresh").unwrap(), 0);
    }
}
