//! Durable storage for the consensus engine's own log.
//!
//! This is not the record log. It holds raft entries (including blank and
//! membership entries) plus the vote and commit bookkeeping the engine
//! needs across restarts. Entries live in segmented newline-delimited JSON
//! files named `<first index, zero-padded>.entries`; `vote.json` and
//! `meta.json` are written atomically (tmp + rename). An in-memory map
//! mirrors the files so range reads and conflict truncation stay cheap:
//!
//! - append: O(1), written through to the active file
//! - purge: O(1) per fully-covered file (whole-file delete)
//! - truncate: rewrites only the file containing the conflict point

use crate::types::{LogEntry, LogVote, NodeId, RaftLogId, StorageError, TypeConfig};
use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{LogState, RaftLogReader, StorageIOError, Vote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Entries per file before rotating to a new one.
const FILE_MAX_ENTRIES: usize = 1024;

const VOTE_FILE: &str = "vote.json";
const META_FILE: &str = "meta.json";

/// Bookkeeping persisted alongside the entry files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaFile {
    committed: Option<RaftLogId>,
    last_purged: Option<RaftLogId>,
}

/// Serialize `value` as JSON into `dir/name` without ever exposing a
/// half-written file.
pub(crate) fn write_json_atomic<T: Serialize>(
    dir: &Path,
    name: &str,
    value: &T,
) -> std::io::Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp, dir.join(name))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> std::io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Persistent raft log storage.
#[derive(Clone)]
pub struct RaftLogStore {
    inner: Arc<RwLock<Inner>>,
}

struct Inner {
    dir: PathBuf,
    entries: BTreeMap<u64, LogEntry>,
    vote: Option<LogVote>,
    committed: Option<RaftLogId>,
    last_purged: Option<RaftLogId>,
    active: Option<ActiveFile>,
}

/// The entry file currently accepting appends.
struct ActiveFile {
    first_index: u64,
    count: usize,
    writer: BufWriter<File>,
}

impl RaftLogStore {
    /// Open or create the store in `dir`, loading every entry file and the
    /// vote/meta bookkeeping.
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut inner = Inner {
            dir,
            entries: BTreeMap::new(),
            vote: None,
            committed: None,
            last_purged: None,
            active: None,
        };
        inner.load()?;

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }
}

impl Inner {
    fn load(&mut self) -> std::io::Result<()> {
        // Meta first: entries at or below the purge point are dead weight
        // and are skipped while loading files.
        if let Some(meta) = read_json::<MetaFile>(&self.dir.join(META_FILE))? {
            self.committed = meta.committed;
            self.last_purged = meta.last_purged;
        }
        self.vote = read_json(&self.dir.join(VOTE_FILE))?;

        let files = self.list_files()?;
        let purged = self.last_purged.map(|id| id.index);
        for (_, path) in &files {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(&line)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                if purged.is_some_and(|p| entry.log_id.index <= p) {
                    continue;
                }
                self.entries.insert(entry.log_id.index, entry);
            }
        }

        // Resume appending into the last file if it still has room.
        if let Some((first_index, path)) = files.last() {
            let count = self.entries.range(*first_index..).count();
            if count < FILE_MAX_ENTRIES {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                self.active = Some(ActiveFile {
                    first_index: *first_index,
                    count,
                    writer: BufWriter::new(file),
                });
            }
        }

        Ok(())
    }

    fn file_name(first_index: u64) -> String {
        format!("{first_index:020}.entries")
    }

    fn file_path(&self, first_index: u64) -> PathBuf {
        self.dir.join(Self::file_name(first_index))
    }

    /// Entry files sorted by first index.
    fn list_files(&self) -> std::io::Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("entries") {
                continue;
            }
            if let Some(first) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                files.push((first, path));
            }
        }
        files.sort_by_key(|(first, _)| *first);
        Ok(files)
    }

    fn is_active(&self, first_index: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.first_index == first_index)
    }

    fn start_file(&mut self, first_index: u64) -> std::io::Result<()> {
        let path = self.file_path(first_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.active = Some(ActiveFile {
            first_index,
            count: 0,
            writer: BufWriter::new(file),
        });
        Ok(())
    }

    fn append_batch(&mut self, entries: Vec<LogEntry>) -> std::io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        for entry in entries {
            let rotate = match &self.active {
                None => true,
                Some(active) => active.count >= FILE_MAX_ENTRIES,
            };
            if rotate {
                if let Some(active) = &mut self.active {
                    active.writer.flush()?;
                    active.writer.get_ref().sync_all()?;
                }
                self.start_file(entry.log_id.index)?;
            }

            let active = self
                .active
                .as_mut()
                .expect("active entry file exists after rotation");
            let json = serde_json::to_string(&entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(active.writer, "{json}")?;
            active.count += 1;

            self.entries.insert(entry.log_id.index, entry);
        }

        if let Some(active) = &mut self.active {
            active.writer.flush()?;
            active.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Rewrite one entry file from the in-memory range starting at its
    /// first index.
    fn rewrite_file(&self, first_index: u64, entries: &[LogEntry]) -> std::io::Result<()> {
        let name = Self::file_name(first_index);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(writer, "{json}")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, self.dir.join(name))
    }

    /// Drop every entry at or after `index` (conflict resolution on a
    /// follower). Files wholly past the point are deleted; the file
    /// containing it is rewritten.
    fn truncate_from(&mut self, index: u64) -> std::io::Result<()> {
        let doomed: Vec<u64> = self.entries.range(index..).map(|(k, _)| *k).collect();
        for key in doomed {
            self.entries.remove(&key);
        }

        let files = self.list_files()?;
        for (i, (first, path)) in files.iter().enumerate() {
            if *first >= index {
                if self.is_active(*first) {
                    self.active = None;
                }
                fs::remove_file(path)?;
                continue;
            }

            // This file covers [first, next file's first); it contains the
            // truncation point when that range reaches past `index`.
            let next_first = files.get(i + 1).map(|(f, _)| *f);
            if next_first.is_some_and(|nf| nf <= index) {
                continue;
            }

            let keep: Vec<LogEntry> = self
                .entries
                .range(*first..index)
                .map(|(_, e)| e.clone())
                .collect();
            if self.is_active(*first) {
                self.active = None;
            }
            if keep.is_empty() {
                fs::remove_file(path)?;
            } else {
                let count = keep.len();
                self.rewrite_file(*first, &keep)?;
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                self.active = Some(ActiveFile {
                    first_index: *first,
                    count,
                    writer: BufWriter::new(file),
                });
            }
        }
        Ok(())
    }

    /// Drop every entry at or below `log_id`, deleting files whose whole
    /// range is covered. Partially covered files are left in place; their
    /// stale prefix is filtered out on the next load.
    fn purge_through(&mut self, log_id: RaftLogId) -> std::io::Result<()> {
        let index = log_id.index;
        self.last_purged = Some(log_id);

        let last_live = self.entries.keys().next_back().copied();
        let doomed: Vec<u64> = self.entries.range(..=index).map(|(k, _)| *k).collect();
        for key in doomed {
            self.entries.remove(&key);
        }

        let files = self.list_files()?;
        for (i, (first, path)) in files.iter().enumerate() {
            let last_in_file = files
                .get(i + 1)
                .map(|(nf, _)| *nf - 1)
                .or(last_live)
                .unwrap_or(index);
            if last_in_file <= index {
                if self.is_active(*first) {
                    self.active = None;
                }
                debug!(file = %path.display(), "purging raft log file");
                fs::remove_file(path)?;
            }
        }

        self.save_meta()
    }

    fn save_meta(&self) -> std::io::Result<()> {
        write_json_atomic(
            &self.dir,
            META_FILE,
            &MetaFile {
                committed: self.committed,
                last_purged: self.last_purged,
            },
        )
    }
}

impl RaftLogReader<TypeConfig> for RaftLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for RaftLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError> {
        let inner = self.inner.read().await;
        let last_log_id = inner
            .entries
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(inner.last_purged);
        Ok(LogState {
            last_purged_log_id: inner.last_purged,
            last_log_id,
        })
    }

    async fn save_committed(&mut self, committed: Option<RaftLogId>) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.committed = committed;
        inner
            .save_meta()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<RaftLogId>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.committed)
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        write_json_atomic(&inner.dir, VOTE_FILE, vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        inner.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.vote)
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let mut inner = self.inner.write().await;
        inner
            .append_batch(entries.into_iter().collect())
            .map_err(|e| StorageIOError::write_logs(&e))?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: RaftLogId) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .truncate_from(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: RaftLogId) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .purge_through(log_id)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
