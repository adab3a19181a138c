//! The replicated state machine over the commit log.
//!
//! Consensus hands committed entries to `apply`; the only recognized
//! command appends a record value to the local commit log. Apply is a pure
//! function of the entry bytes (no clock, no randomness), so every
//! replica that applies the same prefix holds byte-identical store and
//! index files.
//!
//! Snapshots are the raw byte stream of the commit log (the same
//! `len8 || value` frames the store files hold), so restoring is a reset
//! followed by a replay of frames; the restored log reproduces the
//! snapshot's offsets exactly.
//!
//! `last_applied` and the membership are persisted to `applied.json` after
//! every apply batch. Without that a restart would replay the raft log
//! into a commit log that already contains those records and break offset
//! density.

use crate::command::{CommandResponse, LogCommand};
use crate::log_store::{read_json, write_json_atomic};
use crate::types::{
    LogEntry, LogMembership, LogSnapshot, LogSnapshotMeta, RaftLogId, StorageError, TypeConfig,
};
use logship_core::Result;
use logship_storage::codec::LEN_WIDTH;
use logship_storage::{codec, CommitLog};
use openraft::storage::RaftStateMachine;
use openraft::{EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

const APPLIED_FILE: &str = "applied.json";

/// Apply bookkeeping, persisted so restarts resume instead of re-applying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppliedState {
    last_applied: Option<RaftLogId>,
    last_membership: LogMembership,
}

/// A snapshot held in memory for the engine to re-serve.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub meta: LogSnapshotMeta,
    pub data: Vec<u8>,
}

/// The finite state machine: a commit log plus apply bookkeeping.
pub struct LogFsm {
    log: Arc<CommitLog>,
    dir: PathBuf,
    applied: RwLock<AppliedState>,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
}

impl LogFsm {
    /// Wrap `log` as the replicated state machine, recovering apply
    /// bookkeeping from `dir` when present.
    pub fn new(log: Arc<CommitLog>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let applied: AppliedState = read_json(&dir.join(APPLIED_FILE))?.unwrap_or_default();

        Ok(Self {
            log,
            dir,
            applied: RwLock::new(applied),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
        })
    }

    pub fn commit_log(&self) -> Arc<CommitLog> {
        Arc::clone(&self.log)
    }

    /// Replay `len8 || value` frames into the commit log. The stream is
    /// store-format, not RPC-format.
    fn replay_frames(log: &CommitLog, data: &[u8]) -> std::io::Result<u64> {
        let mut cursor = Cursor::new(data);
        let mut count = 0;
        loop {
            let mut len_buf = [0u8; LEN_WIDTH as usize];
            match cursor.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let mut value = vec![0u8; codec::get_u64(&len_buf) as usize];
            cursor.read_exact(&mut value)?;
            log.append(&value)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<LogFsm> {
    async fn build_snapshot(&mut self) -> std::result::Result<LogSnapshot, StorageError> {
        // No apply runs concurrently with snapshotting, so the reader sees
        // a stable prefix.
        let mut data = Vec::new();
        self.log
            .reader()
            .read_to_end(&mut data)
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let applied = self.applied.read().await.clone();

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match applied.last_applied {
            Some(last) => format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx),
            None => format!("--{snapshot_idx}"),
        };

        let meta = LogSnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.last_membership,
            snapshot_id,
        };

        let mut current = self.current_snapshot.write().await;
        *current = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "built log snapshot"
        );

        Ok(LogSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<LogFsm> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<RaftLogId>, LogMembership), StorageError> {
        let applied = self.applied.read().await;
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> std::result::Result<Vec<CommandResponse>, StorageError>
    where
        I: IntoIterator<Item = LogEntry> + Send,
    {
        let mut responses = Vec::new();
        let mut applied = self.applied.write().await;

        for entry in entries {
            applied.last_applied = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => responses.push(CommandResponse::default()),
                EntryPayload::Normal(LogCommand::Append { value }) => {
                    match self.log.append(&value) {
                        Ok(offset) => responses.push(CommandResponse::offset(offset)),
                        Err(e) => {
                            // The leader surfaces this to its append
                            // caller; a follower hitting it has diverging
                            // local storage and needs an operator.
                            error!(index = entry.log_id.index, %e, "append failed during apply");
                            responses.push(CommandResponse::err(e.to_string()));
                        }
                    }
                }
                EntryPayload::Membership(membership) => {
                    applied.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(CommandResponse::default());
                }
            }
        }

        write_json_atomic(&self.dir, APPLIED_FILE, &*applied)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &LogSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> std::result::Result<(), StorageError> {
        let data = snapshot.into_inner();
        info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "installing log snapshot"
        );

        self.log
            .reset()
            .map_err(|e| StorageIOError::write_state_machine(&e))?;
        LogFsm::replay_frames(&self.log, &data)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;

        let mut applied = self.applied.write().await;
        applied.last_applied = meta.last_log_id;
        applied.last_membership = meta.last_membership.clone();
        write_json_atomic(&self.dir, APPLIED_FILE, &*applied)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;
        drop(applied);

        let mut current = self.current_snapshot.write().await;
        *current = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<LogSnapshot>, StorageError> {
        Ok(self.current_snapshot.read().await.as_ref().map(|s| LogSnapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use logship_core::Config;
    use openraft::{CommittedLeaderId, LogId};
    use tempfile::TempDir;

    fn entry(index: u64, value: &str) -> LogEntry {
        LogEntry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(LogCommand::Append {
                value: Bytes::from(value.to_string()),
            }),
        }
    }

    fn fsm_in(dir: &Path) -> Arc<LogFsm> {
        let log = Arc::new(CommitLog::open(dir.join("log"), Config::default()).unwrap());
        Arc::new(LogFsm::new(log, dir.join("raft")).unwrap())
    }

    #[tokio::test]
    async fn test_apply_assigns_dense_offsets() {
        let dir = TempDir::new().unwrap();
        let mut fsm = fsm_in(dir.path());

        let responses = fsm
            .apply(vec![entry(1, "first"), entry(2, "second"), entry(3, "third")])
            .await
            .unwrap();

        let offsets: Vec<_> = responses.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(
            fsm.commit_log().read(1).unwrap().value,
            Bytes::from_static(b"second")
        );
    }

    #[tokio::test]
    async fn test_applied_state_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let mut fsm = fsm_in(dir.path());
            fsm.apply(vec![entry(1, "first"), entry(2, "second")])
                .await
                .unwrap();
        }

        let mut fsm = fsm_in(dir.path());
        let (last_applied, _) = fsm.applied_state().await.unwrap();
        assert_eq!(last_applied.map(|id| id.index), Some(2));
        // The commit log still holds both records without re-applying.
        assert_eq!(fsm.commit_log().highest_offset(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut fsm = fsm_in(dir.path());
        fsm.apply(vec![entry(1, "alpha"), entry(2, "beta"), entry(3, "gamma")])
            .await
            .unwrap();

        let snapshot = fsm.build_snapshot().await.unwrap();

        // The snapshot stream is store-format frames, not RPC messages:
        // 8-byte big-endian length, then the raw value.
        let data = snapshot.snapshot.get_ref().clone();
        assert_eq!(codec::get_u64(&data[..8]), 5);
        assert_eq!(&data[8..13], b"alpha");

        let other_dir = TempDir::new().unwrap();
        let mut other = fsm_in(other_dir.path());
        // Pre-existing state is discarded by the restore.
        other.apply(vec![entry(1, "stale")]).await.unwrap();

        other
            .install_snapshot(&snapshot.meta, Box::new(Cursor::new(data)))
            .await
            .unwrap();

        let log = other.commit_log();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.read(0).unwrap().value, Bytes::from_static(b"alpha"));
        assert_eq!(log.read(2).unwrap().value, Bytes::from_static(b"gamma"));

        let (last_applied, _) = other.applied_state().await.unwrap();
        assert_eq!(last_applied.map(|id| id.index), Some(3));
    }
}
