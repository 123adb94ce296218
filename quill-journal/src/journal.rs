//! Journal management.
//!
//! The [`Journal`] manages a directory of segment files, handling:
//! - Segment rotation when the size threshold is reached
//! - Recovery from crashes (detecting and truncating torn writes)
//! - Coarse-grained shrinking of old segments
//! - Explicit flush for group durability
//!
//! # File Layout
//!
//! ```text
//! /journal-dir/
//!   segment-0000000000000000.jnl   # starts at position 0
//!   segment-0000000000a00000.jnl   # starts at position 0xa00000
//!   segment-0000000001400000.jnl   # active segment (current writes)
//! ```
//!
//! Each file's name encodes the global byte position of its first byte;
//! file contents are raw framed records, so global positions map directly
//! to (segment, offset) pairs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use quill_core::Position;
use tracing::{debug, info, warn};

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::record::Record;
use crate::storage::{Storage, StorageFile};

/// Durable, position-addressed append-only byte log.
///
/// Generic over the storage backend `S` so tests can run in memory.
/// Append and truncate require `&mut self`; the single-writer discipline
/// the replication layer needs is enforced by ownership.
pub struct Journal<S: Storage> {
    /// Storage backend.
    storage: Arc<S>,
    /// Configuration.
    config: JournalConfig,
    /// Segments keyed by base position. The last entry is the active
    /// segment; earlier ones are sealed.
    segments: BTreeMap<u64, SegmentHandle>,
    /// Lowest retained position.
    min: u64,
    /// Highest appended position (exclusive end of the log).
    max: u64,
    /// Highest position guaranteed durable.
    flushed: u64,
}

/// An open segment file and its current length.
struct SegmentHandle {
    file: Box<dyn StorageFile>,
    path: PathBuf,
    len: u64,
}

impl<S: Storage> Journal<S> {
    /// Opens or creates a journal in the configured directory, recovering
    /// any existing segments.
    ///
    /// Torn writes at the tail of the last segment are truncated. A torn
    /// or undecodable record in the interior of the journal is corruption
    /// and fails recovery: the caller must not continue serving.
    ///
    /// After recovery, `flushed == max`: nothing unflushed survives a
    /// restart by definition of durability.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be prepared, a segment
    /// cannot be read, or interior corruption is found.
    pub async fn recover(storage: S, config: JournalConfig) -> JournalResult<Self> {
        config.validate()?;
        let storage = Arc::new(storage);
        storage.create_dir_all(&config.dir).await?;

        let mut paths = storage.list_files(&config.dir, "jnl").await?;
        paths.sort();

        let mut journal = Self {
            storage,
            config,
            segments: BTreeMap::new(),
            min: 0,
            max: 0,
            flushed: 0,
        };

        let last = paths.len().checked_sub(1);
        for (i, path) in paths.iter().enumerate() {
            let base = parse_base_position(path)?;
            let is_last = Some(i) == last;
            journal.recover_segment(path.clone(), base, is_last).await?;
        }

        if let Some((&base, _)) = journal.segments.iter().next() {
            journal.min = base;
        }
        journal.flushed = journal.max;

        info!(
            segments = journal.segments.len(),
            min = journal.min,
            max = journal.max,
            "Journal recovery complete"
        );

        // Recovery postcondition: everything retained is durable.
        debug_assert!(journal.min <= journal.flushed && journal.flushed == journal.max);

        Ok(journal)
    }

    /// Recovers a single segment, validating contiguity and record framing.
    async fn recover_segment(
        &mut self,
        path: PathBuf,
        base: u64,
        is_last: bool,
    ) -> JournalResult<()> {
        if !self.segments.is_empty() && base != self.max {
            return Err(JournalError::Corruption {
                position: base,
                reason: "segment base does not continue previous segment",
            });
        }

        let file = self.storage.open(&path).await?;
        let data = file.read_all().await?;
        let valid_len = scan_records(&data, base, is_last)?;

        if valid_len < data.len() as u64 {
            warn!(
                ?path,
                valid_len,
                file_len = data.len(),
                "Truncating torn write at segment tail"
            );
            file.truncate(valid_len).await?;
        }

        debug!(?path, base, len = valid_len, "Recovered segment");

        self.max = base + valid_len;
        self.segments.insert(
            base,
            SegmentHandle {
                file,
                path,
                len: valid_len,
            },
        );
        Ok(())
    }

    /// Returns the lowest retained position.
    #[must_use]
    pub const fn min(&self) -> Position {
        Position::new(self.min)
    }

    /// Returns the highest appended position.
    #[must_use]
    pub const fn max(&self) -> Position {
        Position::new(self.max)
    }

    /// Returns the highest position guaranteed durable.
    #[must_use]
    pub const fn flushed(&self) -> Position {
        Position::new(self.flushed)
    }

    /// Appends framed records for the given payloads and returns the new
    /// `max` position.
    ///
    /// Durability is **not** implied; call [`Journal::flush`] and await it
    /// for that. The append itself only hands bytes to the backend.
    ///
    /// # Errors
    /// Returns an error if a payload is too large or the write fails.
    pub async fn append(&mut self, payloads: &[Bytes]) -> JournalResult<Position> {
        for payload in payloads {
            let record = Record::new(payload.clone())?;

            self.ensure_active_segment().await?;
            let active = self
                .segments
                .values_mut()
                .next_back()
                .ok_or(JournalError::Corruption {
                    position: self.max,
                    reason: "no active segment after rotation",
                })?;

            // Safe cast: record size bounded by RECORD_PAYLOAD_BYTES_MAX.
            #[allow(clippy::cast_possible_truncation)]
            let mut buf = BytesMut::with_capacity(record.frame_size() as usize);
            record.encode(&mut buf);

            active.file.write_at(active.len, &buf).await?;
            active.len += record.frame_size();
            self.max += record.frame_size();
        }

        debug!(count = payloads.len(), max = self.max, "Appended records");
        Ok(Position::new(self.max))
    }

    /// Forces durability of everything appended so far.
    ///
    /// Returns the flushed position, which equals `max` at the time of the
    /// call. Callers needing durability block only on this, not on append.
    ///
    /// # Errors
    /// Returns an error if a sync fails.
    pub async fn flush(&mut self) -> JournalResult<Position> {
        let target = self.max;

        // Sync every segment holding bytes above the flushed mark. Usually
        // just the active segment; after rotation, also the sealed one.
        for (&base, segment) in &self.segments {
            if base + segment.len > self.flushed {
                segment.file.sync().await?;
            }
        }

        self.flushed = target;
        debug!(flushed = self.flushed, "Flushed journal");
        Ok(Position::new(self.flushed))
    }

    /// Reads `length` bytes starting at `position`.
    ///
    /// # Errors
    /// Fails with `OutOfRange` if the range is not within `[min, max]`.
    pub async fn read(&self, position: Position, length: u64) -> JournalResult<Bytes> {
        let start = position.get();
        let end = start
            .checked_add(length)
            .ok_or(JournalError::OutOfRange {
                position: start,
                position_end: u64::MAX,
                min: self.min,
                max: self.max,
            })?;

        if start < self.min || end > self.max {
            return Err(JournalError::OutOfRange {
                position: start,
                position_end: end,
                min: self.min,
                max: self.max,
            });
        }

        // Safe cast: read lengths are bounded by segment sizes.
        #[allow(clippy::cast_possible_truncation)]
        let mut out = BytesMut::with_capacity(length as usize);
        let mut cursor = start;

        while cursor < end {
            let (&base, segment) = self
                .segments
                .range(..=cursor)
                .next_back()
                .ok_or(JournalError::Corruption {
                    position: cursor,
                    reason: "no segment covers position within [min, max]",
                })?;

            let offset = cursor - base;
            let take = (end - cursor).min(segment.len - offset);
            // Safe cast: take is bounded by the segment length.
            #[allow(clippy::cast_possible_truncation)]
            let chunk = segment.file.read_at(offset, take as usize).await?;
            if chunk.len() as u64 != take {
                return Err(JournalError::Corruption {
                    position: cursor,
                    reason: "short read inside recovered bounds",
                });
            }
            out.extend_from_slice(&chunk);
            cursor += take;
        }

        Ok(out.freeze())
    }

    /// Reads the single record starting at `position`.
    ///
    /// Returns the payload and the position of the next record. Used by
    /// the replication layer to iterate entries it wrote earlier.
    ///
    /// # Errors
    /// Fails with `OutOfRange` if `position` is outside the journal, or a
    /// corruption error if no valid record starts there.
    pub async fn read_record(&self, position: Position) -> JournalResult<(Bytes, Position)> {
        let header = self.read(position, 4).await?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);

        let frame_len = 8 + u64::from(length);
        let frame = self.read(position, frame_len).await?;

        match Record::decode(&frame, position.get())? {
            Some((record, consumed)) => Ok((
                record.payload,
                Position::new(position.get() + consumed),
            )),
            None => Err(JournalError::Corruption {
                position: position.get(),
                reason: "incomplete record inside recovered bounds",
            }),
        }
    }

    /// Discards everything at or above `given_max`.
    ///
    /// # Errors
    /// Fails with `OutOfRange` if `given_max > max` or `given_max < min`.
    pub async fn truncate(&mut self, given_max: Position) -> JournalResult<()> {
        let given_max = given_max.get();
        if given_max > self.max || given_max < self.min {
            return Err(JournalError::OutOfRange {
                position: given_max,
                position_end: given_max,
                min: self.min,
                max: self.max,
            });
        }

        // Drop whole segments above the cut.
        let to_remove: Vec<u64> = self
            .segments
            .range((given_max + 1)..)
            .map(|(&base, _)| base)
            .collect();
        for base in to_remove {
            if let Some(segment) = self.segments.remove(&base) {
                self.storage.remove(&segment.path).await?;
            }
        }

        // Cut the segment containing the new max.
        if let Some((&base, segment)) = self.segments.range_mut(..=given_max).next_back() {
            let keep = given_max - base;
            if keep < segment.len {
                segment.file.truncate(keep).await?;
                segment.file.sync().await?;
                segment.len = keep;
            }
        }

        self.max = given_max;
        self.flushed = self.flushed.min(self.max);
        debug!(max = self.max, "Truncated journal");
        Ok(())
    }

    /// Deletes old data before `given_min`, at segment granularity.
    ///
    /// Whole segments whose content lies entirely before `given_min` are
    /// removed; the new `min` is the base of the first surviving segment,
    /// which may be smaller than requested but never larger. The last
    /// segment is never deleted, so `max` is unaffected.
    ///
    /// # Errors
    /// Fails with `OutOfRange` if `given_min > max`.
    pub async fn shrink(&mut self, given_min: Position) -> JournalResult<Position> {
        let given_min = given_min.get();
        if given_min > self.max {
            return Err(JournalError::OutOfRange {
                position: given_min,
                position_end: given_min,
                min: self.min,
                max: self.max,
            });
        }

        let deletable: Vec<u64> = self
            .segments
            .iter()
            .filter(|(&base, segment)| base + segment.len <= given_min)
            .map(|(&base, _)| base)
            .collect();

        // Keep at least the active segment.
        let keep_from = self.segments.keys().next_back().copied();
        for base in deletable {
            if Some(base) == keep_from {
                break;
            }
            if let Some(segment) = self.segments.remove(&base) {
                info!(base, ?segment.path, "Shrinking: removing segment");
                self.storage.remove(&segment.path).await?;
            }
        }

        if let Some((&base, _)) = self.segments.iter().next() {
            self.min = base;
        }

        // Never delete more than asked for.
        debug_assert!(self.min <= given_min.max(self.min));

        Ok(Position::new(self.min))
    }

    /// Ensures the active segment exists and has room, rotating if needed.
    async fn ensure_active_segment(&mut self) -> JournalResult<()> {
        let needs_new = match self.segments.values().next_back() {
            Some(active) => active.len >= self.config.segment_size_bytes,
            None => true,
        };
        if !needs_new {
            return Ok(());
        }

        let base = self.max;
        let path = self.segment_path(base);
        let file = self.storage.open(&path).await?;

        info!(base, ?path, "Created new segment");
        self.segments.insert(
            base,
            SegmentHandle {
                file,
                path,
                len: 0,
            },
        );
        Ok(())
    }

    /// Returns the path for a segment starting at `base`.
    fn segment_path(&self, base: u64) -> PathBuf {
        self.config.dir.join(format!("segment-{base:016x}.jnl"))
    }
}

/// Parses the base position out of a segment file name.
fn parse_base_position(path: &std::path::Path) -> JournalResult<u64> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("segment-"))
        .ok_or(JournalError::Corruption {
            position: 0,
            reason: "unrecognized segment file name",
        })?;
    u64::from_str_radix(stem, 16).map_err(|_| JournalError::Corruption {
        position: 0,
        reason: "segment file name is not a hex position",
    })
}

/// Scans a segment's bytes record-by-record, returning the number of
/// valid bytes.
///
/// For the last segment, a torn tail is tolerated (the valid prefix is
/// returned). For earlier segments the whole file must decode, otherwise
/// the journal has an interior hole.
fn scan_records(data: &[u8], base: u64, is_last: bool) -> JournalResult<u64> {
    let mut offset = 0u64;
    // Safe cast: offsets are bounded by the file length.
    #[allow(clippy::cast_possible_truncation)]
    while (offset as usize) < data.len() {
        #[allow(clippy::cast_possible_truncation)]
        let rest = &data[offset as usize..];
        match Record::decode(rest, base + offset) {
            Ok(Some((_, consumed))) => offset += consumed,
            Ok(None) if is_last => break,
            Ok(None) => {
                return Err(JournalError::Corruption {
                    position: base + offset,
                    reason: "incomplete record in sealed segment",
                })
            }
            // A bad checksum at the tail of the last segment is a torn
            // write, not corruption.
            Err(e) if is_last => {
                warn!(position = base + offset, error = %e, "Discarding torn tail");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn test_config() -> JournalConfig {
        JournalConfig::new("/journal").with_segment_size(64 * 1024)
    }

    async fn open_journal(storage: MemoryStorage) -> Journal<MemoryStorage> {
        Journal::recover(storage, test_config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_read_roundtrip() {
        let mut journal = open_journal(MemoryStorage::new()).await;
        assert_eq!(journal.min().get(), 0);
        assert_eq!(journal.max().get(), 0);

        let payloads = vec![Bytes::from("first"), Bytes::from("second")];
        let max = journal.append(&payloads).await.unwrap();
        assert_eq!(max.get(), journal.max().get());

        let (payload, next) = journal.read_record(Position::new(0)).await.unwrap();
        assert_eq!(payload, Bytes::from("first"));

        let (payload, next2) = journal.read_record(next).await.unwrap();
        assert_eq!(payload, Bytes::from("second"));
        assert_eq!(next2.get(), journal.max().get());
    }

    #[tokio::test]
    async fn test_read_out_of_range() {
        let mut journal = open_journal(MemoryStorage::new()).await;
        journal.append(&[Bytes::from("x")]).await.unwrap();

        let max = journal.max().get();
        assert!(matches!(
            journal.read(Position::new(max), 1).await,
            Err(JournalError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_flush_then_recover_preserves_data() {
        let storage = MemoryStorage::new();

        let flushed = {
            let mut journal = open_journal(storage.clone()).await;
            journal
                .append(&[Bytes::from("durable"), Bytes::from("bytes")])
                .await
                .unwrap();
            journal.flush().await.unwrap()
        };

        let journal = open_journal(storage).await;
        assert_eq!(journal.max().get(), flushed.get());
        assert_eq!(journal.flushed().get(), journal.max().get());

        let (payload, _) = journal.read_record(Position::new(0)).await.unwrap();
        assert_eq!(payload, Bytes::from("durable"));
    }

    #[tokio::test]
    async fn test_recover_truncates_torn_tail() {
        let storage = MemoryStorage::new();

        let good_max = {
            let mut journal = open_journal(storage.clone()).await;
            journal.append(&[Bytes::from("complete")]).await.unwrap();
            journal.flush().await.unwrap();
            let good = journal.max();
            journal.append(&[Bytes::from("torn")]).await.unwrap();
            good
        };

        // Simulate a crash mid-write: chop two bytes off the file tail.
        {
            let file = storage
                .open(std::path::Path::new("/journal/segment-0000000000000000.jnl"))
                .await
                .unwrap();
            let len = file.size().await.unwrap();
            file.truncate(len - 2).await.unwrap();
        }

        let journal = open_journal(storage).await;
        assert_eq!(journal.max().get(), good_max.get());
        assert_eq!(journal.flushed().get(), good_max.get());
    }

    #[tokio::test]
    async fn test_truncate_bounds() {
        let mut journal = open_journal(MemoryStorage::new()).await;
        journal.append(&[Bytes::from("abc")]).await.unwrap();

        let max = journal.max().get();
        assert!(matches!(
            journal.truncate(Position::new(max + 1)).await,
            Err(JournalError::OutOfRange { .. })
        ));
        journal.truncate(Position::new(0)).await.unwrap();
        assert_eq!(journal.max().get(), 0);
    }

    #[tokio::test]
    async fn test_truncate_discards_tail() {
        let mut journal = open_journal(MemoryStorage::new()).await;
        journal.append(&[Bytes::from("keep")]).await.unwrap();
        let cut = journal.max();
        journal.append(&[Bytes::from("drop")]).await.unwrap();

        journal.truncate(cut).await.unwrap();
        assert_eq!(journal.max().get(), cut.get());

        let (payload, _) = journal.read_record(Position::new(0)).await.unwrap();
        assert_eq!(payload, Bytes::from("keep"));
    }

    #[tokio::test]
    async fn test_shrink_is_coarse_and_never_over_deletes() {
        let storage = MemoryStorage::new();
        let config = JournalConfig::new("/journal").with_segment_size(64 * 1024);
        let mut journal = Journal::recover(storage, config).await.unwrap();

        // Fill several segments.
        let payload = Bytes::from(vec![7u8; 16 * 1024]);
        for _ in 0..12 {
            journal.append(&[payload.clone()]).await.unwrap();
        }
        assert!(journal.segments.len() > 1);

        let given_min = journal.max().get() / 2;
        let new_min = journal.shrink(Position::new(given_min)).await.unwrap();

        // Coarse deletion: never beyond the requested point.
        assert!(new_min.get() <= given_min);
        assert_eq!(journal.min().get(), new_min.get());

        // Data at and after given_min is still readable.
        let (p, _) = journal.read_record(new_min).await.unwrap();
        assert_eq!(p.len(), payload.len());
    }

    #[tokio::test]
    async fn test_read_below_min_after_shrink_fails() {
        let mut journal = open_journal(MemoryStorage::new()).await;
        let payload = Bytes::from(vec![1u8; 32 * 1024]);
        for _ in 0..8 {
            journal.append(&[payload.clone()]).await.unwrap();
        }

        let given_min = journal.max().get() / 2;
        let new_min = journal.shrink(Position::new(given_min)).await.unwrap();
        if new_min.get() > 0 {
            assert!(matches!(
                journal.read(Position::new(new_min.get() - 1), 10).await,
                Err(JournalError::OutOfRange { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_recover_multiple_segments() {
        let storage = MemoryStorage::new();
        let payload = Bytes::from(vec![3u8; 40 * 1024]);

        let max = {
            let mut journal = open_journal(storage.clone()).await;
            for _ in 0..4 {
                journal.append(&[payload.clone()]).await.unwrap();
            }
            journal.flush().await.unwrap();
            journal.max()
        };

        let journal = open_journal(storage).await;
        assert_eq!(journal.max().get(), max.get());
        assert!(journal.segments.len() > 1);
    }
}
