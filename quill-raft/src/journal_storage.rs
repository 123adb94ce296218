//! Journal-backed consensus storage.
//!
//! Persists log entries as journal records and keeps the term/vote record
//! and latest snapshot in separate files, so the vote record can be read
//! before any election participation on restart.
//!
//! Layout under the node's working directory:
//!
//! ```text
//! /data-dir/
//!   segments/              # journal segment files (log entries)
//!   term_vote.bin          # PersistentState with trailing CRC
//!   snapshot.bin           # latest durable snapshot
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::BytesMut;
use quill_core::{LogIndex, Position};
use quill_journal::{Journal, JournalConfig, JournalError, Storage};
use tracing::{debug, info};

use crate::error::{RaftError, RaftResult};
use crate::log::LogEntry;
use crate::snapshot::Snapshot;
use crate::storage::{PersistentState, RaftStorage};

/// Durable consensus storage over a position-addressed journal.
pub struct JournalRaftStorage<S: Storage + Clone> {
    journal: Journal<S>,
    storage: S,
    state_path: PathBuf,
    snapshot_path: PathBuf,
    /// Byte position of each retained entry, parallel to the index range
    /// `[first_index, first_index + positions.len())`.
    positions: Vec<Position>,
    first_index: u64,
}

impl<S: Storage + Clone> JournalRaftStorage<S> {
    /// Opens or creates consensus storage under `dir`, recovering the
    /// journal and rebuilding the index-to-position map.
    ///
    /// # Errors
    /// Returns an error if recovery fails or persisted entries are
    /// undecodable (corruption).
    pub async fn recover(storage: S, dir: impl Into<PathBuf>) -> RaftResult<Self> {
        let dir = dir.into();
        let journal_config = JournalConfig::new(dir.join("segments"));
        let journal = Journal::recover(storage.clone(), journal_config)
            .await
            .map_err(journal_error)?;

        let mut this = Self {
            journal,
            storage,
            state_path: dir.join("term_vote.bin"),
            snapshot_path: dir.join("snapshot.bin"),
            positions: Vec::new(),
            first_index: 0,
        };
        this.rebuild_positions().await?;

        info!(
            entries = this.positions.len(),
            first_index = this.first_index,
            "Recovered consensus storage"
        );
        Ok(this)
    }

    /// Scans the journal and rebuilds the index-to-position map.
    async fn rebuild_positions(&mut self) -> RaftResult<()> {
        self.positions.clear();
        self.first_index = 0;

        let mut position = self.journal.min();
        while position < self.journal.max() {
            let (payload, next) = self
                .journal
                .read_record(position)
                .await
                .map_err(journal_error)?;
            let entry = LogEntry::decode(&mut &payload[..])?;

            if self.positions.is_empty() {
                self.first_index = entry.index.get();
            } else if entry.index.get() != self.first_index + self.positions.len() as u64 {
                return Err(RaftError::PersistenceCorruption {
                    reason: format!("non-contiguous entry index {} in journal", entry.index),
                });
            }
            self.positions.push(position);
            position = next;
        }
        Ok(())
    }

    fn last_index(&self) -> u64 {
        if self.positions.is_empty() {
            0
        } else {
            self.first_index + self.positions.len() as u64 - 1
        }
    }

    fn position_of(&self, index: LogIndex) -> Option<Position> {
        let i = index.get();
        if self.positions.is_empty() || i < self.first_index {
            return None;
        }
        // Safe cast: retained entries fit in memory.
        #[allow(clippy::cast_possible_truncation)]
        self.positions.get((i - self.first_index) as usize).copied()
    }

    /// Writes a small record file (term/vote or snapshot) and syncs it.
    async fn write_file(&self, path: &std::path::Path, data: &[u8]) -> RaftResult<()> {
        let file = self
            .storage
            .open(path)
            .await
            .map_err(journal_error)?;
        file.truncate(0).await.map_err(journal_error)?;
        file.write_at(0, data).await.map_err(journal_error)?;
        file.sync().await.map_err(journal_error)
    }

    async fn read_file(&self, path: &std::path::Path) -> RaftResult<Option<bytes::Bytes>> {
        let file = self
            .storage
            .open(path)
            .await
            .map_err(journal_error)?;
        let data = file.read_all().await.map_err(journal_error)?;
        if data.is_empty() {
            Ok(None)
        } else {
            Ok(Some(data))
        }
    }
}

#[async_trait]
impl<S: Storage + Clone> RaftStorage for JournalRaftStorage<S> {
    async fn save_state(&mut self, state: PersistentState) -> RaftResult<()> {
        self.write_file(&self.state_path, &state.encode()).await
    }

    async fn load_state(&self) -> RaftResult<Option<PersistentState>> {
        match self.read_file(&self.state_path).await? {
            Some(data) => Ok(Some(PersistentState::decode(&data)?)),
            None => Ok(None),
        }
    }

    async fn append_entries(
        &mut self,
        from_index: LogIndex,
        entries: &[LogEntry],
    ) -> RaftResult<()> {
        let from = from_index.get();
        let last = self.last_index();

        if from <= last {
            // Conflict truncation: discard the divergent suffix first.
            let position = self
                .position_of(from_index)
                .ok_or_else(|| RaftError::PersistenceCorruption {
                    reason: format!("truncation point {from_index} below retained log"),
                })?;
            self.journal
                .truncate(position)
                .await
                .map_err(journal_error)?;
            // Safe cast: retained entries fit in memory.
            #[allow(clippy::cast_possible_truncation)]
            self.positions.truncate((from - self.first_index) as usize);
            debug!(%from_index, "Truncated journal suffix for conflicting entries");
        } else if from != last + 1 && !self.positions.is_empty() {
            return Err(RaftError::storage(
                "append",
                format!("gap: appending {from} after {last}"),
            ));
        }

        for entry in entries {
            let position = self.journal.max();
            let mut buf = BytesMut::with_capacity(entry.encoded_size());
            entry.encode(&mut buf);
            self.journal
                .append(&[buf.freeze()])
                .await
                .map_err(journal_error)?;

            if self.positions.is_empty() {
                self.first_index = entry.index.get();
            }
            self.positions.push(position);
        }

        // Entries must be durable before the node acknowledges them.
        self.journal.flush().await.map_err(journal_error)?;
        Ok(())
    }

    async fn load_entries(&self) -> RaftResult<Vec<LogEntry>> {
        let mut entries = Vec::with_capacity(self.positions.len());
        for &position in &self.positions {
            let (payload, _) = self
                .journal
                .read_record(position)
                .await
                .map_err(journal_error)?;
            entries.push(LogEntry::decode(&mut &payload[..])?);
        }
        Ok(entries)
    }

    async fn compact(&mut self, last_included_index: LogIndex) -> RaftResult<()> {
        let boundary = LogIndex::new(last_included_index.get() + 1);
        let target = self
            .position_of(boundary)
            .unwrap_or_else(|| self.journal.max());

        let new_min = self.journal.shrink(target).await.map_err(journal_error)?;

        // Coarse deletion: the journal may retain more than asked; the
        // position map follows whatever actually survived.
        let kept = self.positions.iter().position(|&p| p >= new_min);
        match kept {
            Some(drop_count) => {
                self.positions.drain(..drop_count);
                self.first_index += drop_count as u64;
            }
            None => {
                self.first_index = 0;
                self.positions.clear();
            }
        }

        debug!(
            %last_included_index,
            first_index = self.first_index,
            "Compacted journal"
        );
        Ok(())
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> RaftResult<()> {
        self.write_file(&self.snapshot_path, &snapshot.encode())
            .await
    }

    async fn load_snapshot(&self) -> RaftResult<Option<Snapshot>> {
        match self.read_file(&self.snapshot_path).await? {
            Some(data) => {
                let snapshot =
                    Snapshot::decode(data).ok_or_else(|| RaftError::PersistenceCorruption {
                        reason: "snapshot file failed validation".to_string(),
                    })?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }
}

fn journal_error(err: JournalError) -> RaftError {
    if err.is_corruption() {
        RaftError::PersistenceCorruption {
            reason: err.to_string(),
        }
    } else {
        RaftError::storage("journal", err)
    }
}
