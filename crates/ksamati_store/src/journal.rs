//! Append-only journal shared by the sync tables.
//!
//! Every mutation of the four sync tables is written here before it touches
//! the in-memory table state. The on-disk format is a sequence of frames:
//!
//! ```text
//! | magic (4) | version (2) | table (1) | length (4) | CBOR payload | CRC32 (4) |
//! ```
//!
//! Multi-record mutations (a sync cycle commit, a remote-wins resolution)
//! are bracketed by `BatchBegin`/`BatchCommit` frames and written with a
//! single append. On replay a batch without its commit frame is discarded.
//!
//! # Recovery
//!
//! - A frame cut short by the end of the file is a torn tail
//! - A CRC mismatch on the final frame is a torn tail
//! - An uncommitted batch at the end is a torn tail
//! - Anything else that fails to parse is corruption and aborts replay
//!
//! Writable opens truncate the torn tail; read-only opens only report it.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use ksamati_sync_protocol::{
    decode_cbor, encode_cbor, ChangeEntry, DeviceId, DeviceStatus, EntryId, SyncConflict,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic bytes at the start of every journal frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"KSJR";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + table (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// The logical table a journal frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Table {
    /// Outgoing change entries.
    OfflineQueue = 1,
    /// Changes received from the central store.
    DataSync = 2,
    /// Conflict records.
    SyncConflicts = 3,
    /// Device cursors and sync status.
    DeviceSyncStatus = 4,
    /// Schema and batch control frames.
    Control = 5,
}

impl Table {
    /// The four sync tables, in report order.
    pub const SYNC_TABLES: [Table; 4] = [
        Table::DataSync,
        Table::OfflineQueue,
        Table::SyncConflicts,
        Table::DeviceSyncStatus,
    ];

    /// Converts a tag byte to a table.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Table::OfflineQueue),
            2 => Some(Table::DataSync),
            3 => Some(Table::SyncConflicts),
            4 => Some(Table::DeviceSyncStatus),
            5 => Some(Table::Control),
            _ => None,
        }
    }

    /// Returns the tag byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the table name.
    pub fn name(self) -> &'static str {
        match self {
            Table::OfflineQueue => "offline_queue",
            Table::DataSync => "data_sync",
            Table::SyncConflicts => "sync_conflicts",
            Table::DeviceSyncStatus => "device_sync_status",
            Table::Control => "control",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A table was provisioned.
    TableCreated(Table),
    /// A local change was queued.
    ChangeAppended(ChangeEntry),
    /// A change from another device was received.
    ChangeIncoming {
        /// The change as the central store applied it.
        entry: ChangeEntry,
        /// Entity version it produced.
        server_version: u64,
    },
    /// A queued change was settled with the central store.
    ChangeSettled {
        /// Settled entry.
        entry_id: EntryId,
        /// Settlement time.
        synced_at: DateTime<Utc>,
        /// Entity version produced, if the entry was applied.
        server_version: Option<u64>,
    },
    /// A conflict was recorded or updated.
    ConflictUpserted(SyncConflict),
    /// A device's cursors moved forward.
    CursorAdvanced {
        /// Device.
        device_id: DeviceId,
        /// Highest local seq settled.
        cursor: u64,
        /// Central feed position pulled.
        remote_cursor: u64,
    },
    /// A device's status row was replaced.
    StatusUpdated(DeviceStatus),
    /// Opens an atomic batch.
    BatchBegin {
        /// Batch id.
        batch_id: u64,
    },
    /// Commits the batch with the same id.
    BatchCommit {
        /// Batch id.
        batch_id: u64,
    },
}

impl JournalRecord {
    /// Returns the table this record belongs to.
    pub fn table(&self) -> Table {
        match self {
            JournalRecord::ChangeAppended(_) | JournalRecord::ChangeSettled { .. } => {
                Table::OfflineQueue
            }
            JournalRecord::ChangeIncoming { .. } => Table::DataSync,
            JournalRecord::ConflictUpserted(_) => Table::SyncConflicts,
            JournalRecord::CursorAdvanced { .. } | JournalRecord::StatusUpdated(_) => {
                Table::DeviceSyncStatus
            }
            JournalRecord::TableCreated(_)
            | JournalRecord::BatchBegin { .. }
            | JournalRecord::BatchCommit { .. } => Table::Control,
        }
    }

    /// Encodes the record as one framed journal entry.
    pub fn encode_frame(&self) -> StoreResult<Vec<u8>> {
        let payload = encode_cbor(self)?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&JOURNAL_MAGIC);
        buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        buf.push(self.table().as_byte());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Outcome of replaying the journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// Committed records in write order.
    pub records: Vec<JournalRecord>,
    /// Number of frames read, including control frames.
    pub frames: u64,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Bytes after the valid prefix.
    pub torn_bytes: u64,
    /// Batches dropped because their commit frame was missing.
    pub discarded_batches: u64,
    /// Highest batch id seen.
    pub max_batch_id: u64,
}

/// The journal: framed records over a storage backend.
pub struct Journal {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
    read_only: bool,
    next_batch_id: AtomicU64,
    poisoned_at: Mutex<Option<u64>>,
}

impl Journal {
    /// Creates a journal over a backend.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool, read_only: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
            read_only,
            next_batch_id: AtomicU64::new(1),
            poisoned_at: Mutex::new(None),
        }
    }

    /// Returns true if writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the journal size in bytes.
    pub fn size(&self) -> StoreResult<u64> {
        self.backend.lock().size()
    }

    /// Appends one record, returning its offset.
    pub fn append(&self, record: &JournalRecord) -> StoreResult<u64> {
        self.ensure_writable()?;
        let frame = record.encode_frame()?;
        self.write(&frame)
    }

    /// Appends records as one atomic batch, returning the batch offset.
    ///
    /// Either all records are visible after replay or none are.
    pub fn append_batch(&self, records: &[JournalRecord]) -> StoreResult<u64> {
        self.ensure_writable()?;
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        let mut buf = JournalRecord::BatchBegin { batch_id }.encode_frame()?;
        for record in records {
            buf.extend_from_slice(&record.encode_frame()?);
        }
        buf.extend_from_slice(&JournalRecord::BatchCommit { batch_id }.encode_frame()?);

        let offset = self.write(&buf)?;
        tracing::trace!(batch_id, records = records.len(), offset, "journal batch written");
        Ok(offset)
    }

    /// Reads all committed records.
    pub fn replay(&self) -> StoreResult<Replay> {
        let backend = self.backend.lock();
        let size = backend.size()?;
        let mut replay = Replay::default();
        let mut open_batch: Option<(u64, Vec<JournalRecord>)> = None;
        let mut offset = 0u64;

        while offset < size {
            let remaining = size - offset;
            if remaining < HEADER_SIZE as u64 {
                break;
            }
            let header = backend.read_at(offset, HEADER_SIZE)?;
            if header[0..4] != JOURNAL_MAGIC {
                return Err(StoreError::corrupted(offset, "invalid magic"));
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version != JOURNAL_VERSION {
                return Err(StoreError::corrupted(
                    offset,
                    format!("unsupported journal version {version}"),
                ));
            }
            if Table::from_byte(header[6]).is_none() {
                return Err(StoreError::corrupted(
                    offset,
                    format!("unknown table tag {}", header[6]),
                ));
            }
            let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
            let frame_len = (HEADER_SIZE + len + CRC_SIZE) as u64;
            if frame_len > remaining {
                break;
            }

            let body = backend.read_at(offset + HEADER_SIZE as u64, len + CRC_SIZE)?;
            let (payload, crc_bytes) = body.split_at(len);
            let stored_crc =
                u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
            let mut checked = header;
            checked.extend_from_slice(payload);
            if compute_crc32(&checked) != stored_crc {
                if offset + frame_len == size {
                    break;
                }
                return Err(StoreError::corrupted(offset, "checksum mismatch"));
            }

            let record: JournalRecord = decode_cbor(payload)
                .map_err(|e| StoreError::corrupted(offset, e.to_string()))?;
            replay.frames += 1;
            let frame_end = offset + frame_len;

            match record {
                JournalRecord::BatchBegin { batch_id } => {
                    if open_batch.is_some() {
                        return Err(StoreError::corrupted(offset, "nested batch"));
                    }
                    replay.max_batch_id = replay.max_batch_id.max(batch_id);
                    open_batch = Some((batch_id, Vec::new()));
                }
                JournalRecord::BatchCommit { batch_id } => match open_batch.take() {
                    Some((open_id, records)) if open_id == batch_id => {
                        replay.records.extend(records);
                        replay.valid_len = frame_end;
                    }
                    _ => {
                        return Err(StoreError::corrupted(
                            offset,
                            format!("commit for unknown batch {batch_id}"),
                        ))
                    }
                },
                other => match open_batch.as_mut() {
                    Some((_, records)) => records.push(other),
                    None => {
                        replay.records.push(other);
                        replay.valid_len = frame_end;
                    }
                },
            }
            offset = frame_end;
        }

        if open_batch.is_some() {
            replay.discarded_batches += 1;
        }
        replay.torn_bytes = size - replay.valid_len;
        self.next_batch_id
            .fetch_max(replay.max_batch_id + 1, Ordering::SeqCst);
        Ok(replay)
    }

    /// Drops everything after `valid_len`.
    pub fn truncate_tail(&self, valid_len: u64) -> StoreResult<()> {
        self.ensure_writable()?;
        let mut backend = self.backend.lock();
        backend.truncate(valid_len)?;
        backend.sync()
    }

    /// Appends `bytes` at the end. On failure the journal is cut back to
    /// its previous length so no partial frame stays ahead of later writes.
    fn write(&self, bytes: &[u8]) -> StoreResult<u64> {
        let mut backend = self.backend.lock();
        let prev_size = backend.size()?;
        let result = match backend.append(bytes) {
            Ok(offset) if self.sync_on_write => backend.sync().map(|()| offset),
            other => other,
        };

        if let Err(err) = &result {
            match backend.truncate(prev_size) {
                Ok(()) => {
                    tracing::warn!(offset = prev_size, error = %err, "journal write rolled back");
                }
                Err(rollback) => {
                    tracing::error!(
                        offset = prev_size,
                        error = %err,
                        rollback_error = %rollback,
                        "journal write could not be rolled back"
                    );
                    *self.poisoned_at.lock() = Some(prev_size);
                }
            }
        }
        result
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        match *self.poisoned_at.lock() {
            Some(offset) => Err(StoreError::Poisoned(offset)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_write", &self.sync_on_write)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Computes the CRC32 (IEEE) checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use ksamati_sync_protocol::NewChange;
    use serde_json::json;

    fn change(n: u64) -> JournalRecord {
        let new = NewChange::create(
            DeviceId::new("site-laptop"),
            "task",
            format!("T-{n}"),
            json!({"name": format!("task {n}")}),
        );
        JournalRecord::ChangeAppended(ChangeEntry::from_new(new, n, Utc::now()))
    }

    fn journal(backend: &InMemoryBackend) -> Journal {
        Journal::new(Box::new(backend.clone()), false, false)
    }

    /// Writes half of the next append, reports an I/O error, then recovers.
    struct HalfWriteOnce {
        inner: InMemoryBackend,
        fail_next: bool,
        truncate_fails: bool,
    }

    impl HalfWriteOnce {
        fn new(inner: &InMemoryBackend) -> Self {
            Self {
                inner: inner.clone(),
                fail_next: true,
                truncate_fails: false,
            }
        }
    }

    impl StorageBackend for HalfWriteOnce {
        fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
            if std::mem::take(&mut self.fail_next) {
                self.inner.append(&data[..data.len() / 2])?;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.append(data)
        }

        fn sync(&mut self) -> StoreResult<()> {
            self.inner.sync()
        }

        fn size(&self) -> StoreResult<u64> {
            self.inner.size()
        }

        fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
            if self.truncate_fails {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "device gone").into());
            }
            self.inner.truncate(new_size)
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn frame_layout() {
        let frame = change(1).encode_frame().unwrap();
        assert_eq!(&frame[0..4], b"KSJR");
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), JOURNAL_VERSION);
        assert_eq!(frame[6], Table::OfflineQueue.as_byte());
        let len = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]) as usize;
        assert_eq!(frame.len(), HEADER_SIZE + len + CRC_SIZE);
    }

    #[test]
    fn replay_returns_records_in_order() {
        let backend = InMemoryBackend::new();
        let j = journal(&backend);
        j.append(&change(1)).unwrap();
        j.append_batch(&[change(2), change(3)]).unwrap();
        j.append(&change(4)).unwrap();

        let replay = journal(&backend).replay().unwrap();
        let seqs: Vec<u64> = replay
            .records
            .iter()
            .map(|r| match r {
                JournalRecord::ChangeAppended(e) => e.seq,
                other => panic!("unexpected record {other:?}"),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(replay.frames, 6);
        assert_eq!(replay.torn_bytes, 0);
        assert_eq!(replay.max_batch_id, 1);
    }

    #[test]
    fn torn_frame_is_tail() {
        let backend = InMemoryBackend::new();
        let j = journal(&backend);
        j.append(&change(1)).unwrap();
        let valid = j.size().unwrap();
        j.append(&change(2)).unwrap();

        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 7);
        let torn = InMemoryBackend::with_data(bytes);

        let replay = journal(&torn).replay().unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.valid_len, valid);
        assert!(replay.torn_bytes > 0);
    }

    #[test]
    fn uncommitted_batch_is_discarded() {
        let backend = InMemoryBackend::new();
        let j = journal(&backend);
        j.append(&change(1)).unwrap();
        let valid = j.size().unwrap();
        j.append_batch(&[change(2), change(3)]).unwrap();

        // Cut off the commit frame.
        let commit_len = JournalRecord::BatchCommit { batch_id: 1 }
            .encode_frame()
            .unwrap()
            .len();
        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - commit_len);
        let torn = InMemoryBackend::with_data(bytes);

        let torn_journal = journal(&torn);
        let replay = torn_journal.replay().unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.discarded_batches, 1);
        assert_eq!(replay.valid_len, valid);

        torn_journal.truncate_tail(replay.valid_len).unwrap();
        assert_eq!(torn.size().unwrap(), valid);
    }

    #[test]
    fn checksum_mismatch_before_tail_is_corruption() {
        let backend = InMemoryBackend::new();
        let j = journal(&backend);
        j.append(&change(1)).unwrap();
        j.append(&change(2)).unwrap();

        let mut bytes = backend.data();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        let damaged = InMemoryBackend::with_data(bytes);

        assert!(matches!(
            journal(&damaged).replay(),
            Err(StoreError::Corrupted { offset: 0, .. })
        ));
    }

    #[test]
    fn checksum_mismatch_on_last_frame_is_tail() {
        let backend = InMemoryBackend::new();
        let j = journal(&backend);
        j.append(&change(1)).unwrap();
        j.append(&change(2)).unwrap();

        let mut bytes = backend.data();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let damaged = InMemoryBackend::with_data(bytes);

        let replay = journal(&damaged).replay().unwrap();
        assert_eq!(replay.records.len(), 1);
        assert!(replay.torn_bytes > 0);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let damaged = InMemoryBackend::with_data(b"NOPE-and-some-more-bytes".to_vec());
        assert!(matches!(
            journal(&damaged).replay(),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn batch_ids_continue_after_replay() {
        let backend = InMemoryBackend::new();
        let j = journal(&backend);
        j.append_batch(&[change(1)]).unwrap();
        j.append_batch(&[change(2)]).unwrap();

        let reopened = journal(&backend);
        let replay = reopened.replay().unwrap();
        assert_eq!(replay.max_batch_id, 2);
        reopened.append_batch(&[change(3)]).unwrap();
        assert_eq!(reopened.replay().unwrap().max_batch_id, 3);
    }

    #[test]
    fn failed_append_leaves_no_partial_frame() {
        let backend = InMemoryBackend::new();
        let j = Journal::new(Box::new(HalfWriteOnce::new(&backend)), false, false);
        let seeded = journal(&backend);
        seeded.append(&change(1)).unwrap();
        let before = backend.size().unwrap();

        assert!(matches!(j.append(&change(2)), Err(StoreError::Io(_))));
        assert_eq!(backend.size().unwrap(), before);

        j.append(&change(3)).unwrap();
        j.append_batch(&[change(4)]).unwrap();

        let replay = journal(&backend).replay().unwrap();
        let seqs: Vec<u64> = replay
            .records
            .iter()
            .map(|r| match r {
                JournalRecord::ChangeAppended(e) => e.seq,
                other => panic!("unexpected record {other:?}"),
            })
            .collect();
        assert_eq!(seqs, vec![1, 3, 4]);
        assert_eq!(replay.torn_bytes, 0);
    }

    #[test]
    fn failed_batch_leaves_no_partial_frame() {
        let backend = InMemoryBackend::new();
        let j = Journal::new(Box::new(HalfWriteOnce::new(&backend)), false, false);

        assert!(j.append_batch(&[change(1), change(2)]).is_err());
        assert_eq!(backend.size().unwrap(), 0);

        j.append_batch(&[change(3)]).unwrap();
        let replay = journal(&backend).replay().unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.discarded_batches, 0);
    }

    #[test]
    fn unrecoverable_write_refuses_further_appends() {
        let backend = InMemoryBackend::new();
        let mut flaky = HalfWriteOnce::new(&backend);
        flaky.truncate_fails = true;
        let j = Journal::new(Box::new(flaky), false, false);

        assert!(matches!(j.append(&change(1)), Err(StoreError::Io(_))));
        assert!(matches!(
            j.append(&change(2)),
            Err(StoreError::Poisoned(0))
        ));

        // Reopening treats the half frame as a torn tail.
        let reopened = journal(&backend);
        let replay = reopened.replay().unwrap();
        assert!(replay.records.is_empty());
        assert!(replay.torn_bytes > 0);
    }

    #[test]
    fn read_only_journal_refuses_appends() {
        let j = Journal::new(Box::new(InMemoryBackend::new()), false, true);
        assert!(matches!(j.append(&change(1)), Err(StoreError::ReadOnly)));
        assert!(matches!(j.append_batch(&[]), Err(StoreError::ReadOnly)));
    }
}
