//! Frame-by-frame journal scanning.
//!
//! Unlike replay at open, the scanner keeps every frame it reads (batch
//! control frames included) together with its offset, and stops at the
//! first frame it cannot read instead of failing.

use ksamati_store::{
    compute_crc32, journal_path, FileBackend, JournalRecord, StorageBackend, Table,
    JOURNAL_MAGIC, JOURNAL_VERSION,
};
use ksamati_sync_protocol::decode_cbor;
use std::path::Path;

/// Magic (4) + version (2) + table tag (1) + payload length (4).
const HEADER_SIZE: u64 = 11;
const CRC_SIZE: u64 = 4;

/// One readable journal frame.
#[derive(Debug)]
pub struct Frame {
    /// Offset of the frame in the journal file.
    pub offset: u64,
    /// Table tag of the frame.
    pub table: Table,
    /// CBOR payload size in bytes.
    pub payload_size: usize,
    /// The decoded record.
    pub record: JournalRecord,
}

/// Why a scan stopped before the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stop {
    /// Offset of the unreadable frame.
    pub offset: u64,
    /// What was wrong with it.
    pub reason: String,
    /// True if the frame was cut short, as after a crash mid-write.
    pub torn: bool,
}

/// Result of scanning a journal.
#[derive(Debug)]
pub struct Scan {
    /// Journal size in bytes.
    pub size: u64,
    /// Frames read, in file order.
    pub frames: Vec<Frame>,
    /// Length of the readable prefix.
    pub valid_len: u64,
    /// Set if the scan stopped early.
    pub stop: Option<Stop>,
}

/// Opens the journal of a store directory without write access.
pub fn open_journal(path: &Path) -> Result<FileBackend, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }
    Ok(FileBackend::open_read_only(&journal_path(path))?)
}

/// Reads frames until the end of the journal or the first bad frame.
pub fn scan(backend: &dyn StorageBackend) -> Result<Scan, Box<dyn std::error::Error>> {
    let size = backend.size()?;
    let mut frames = Vec::new();
    let mut offset = 0u64;

    let stop = loop {
        if offset >= size {
            break None;
        }
        let remaining = size - offset;
        if remaining < HEADER_SIZE {
            break Some(torn(offset, "truncated header"));
        }

        let header = backend.read_at(offset, HEADER_SIZE as usize)?;
        if header[0..4] != JOURNAL_MAGIC {
            break Some(corrupt(offset, format!("invalid magic {:?}", &header[0..4])));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != JOURNAL_VERSION {
            break Some(corrupt(offset, format!("unsupported version {}", version)));
        }
        let Some(table) = Table::from_byte(header[6]) else {
            break Some(corrupt(offset, format!("unknown table tag {}", header[6])));
        };
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;

        let frame_size = HEADER_SIZE + len + CRC_SIZE;
        if frame_size > remaining {
            break Some(torn(
                offset,
                format!(
                    "truncated frame: needs {} bytes, only {} available",
                    frame_size, remaining
                ),
            ));
        }

        let data = backend.read_at(offset, frame_size as usize)?;
        let body_end = (HEADER_SIZE + len) as usize;
        let stored_crc = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let computed_crc = compute_crc32(&data[..body_end]);
        if stored_crc != computed_crc {
            let reason = format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                stored_crc, computed_crc
            );
            // A bad final frame is a write cut short.
            if offset + frame_size == size {
                break Some(torn(offset, reason));
            }
            break Some(corrupt(offset, reason));
        }

        let record: JournalRecord = match decode_cbor(&data[HEADER_SIZE as usize..body_end]) {
            Ok(record) => record,
            Err(e) => break Some(corrupt(offset, format!("undecodable payload: {}", e))),
        };
        if record.table() != table {
            break Some(corrupt(
                offset,
                format!("{} record tagged as {}", record.table(), table),
            ));
        }

        frames.push(Frame {
            offset,
            table,
            payload_size: len as usize,
            record,
        });
        offset += frame_size;
    };

    Ok(Scan {
        size,
        frames,
        valid_len: offset,
        stop,
    })
}

fn torn(offset: u64, reason: impl Into<String>) -> Stop {
    Stop {
        offset,
        reason: reason.into(),
        torn: true,
    }
}

fn corrupt(offset: u64, reason: impl Into<String>) -> Stop {
    Stop {
        offset,
        reason: reason.into(),
        torn: false,
    }
}

/// Returns a short label for a record.
pub fn record_kind(record: &JournalRecord) -> &'static str {
    match record {
        JournalRecord::TableCreated(_) => "TABLE",
        JournalRecord::ChangeAppended(_) => "APPEND",
        JournalRecord::ChangeIncoming { .. } => "INCOMING",
        JournalRecord::ChangeSettled { .. } => "SETTLE",
        JournalRecord::ConflictUpserted(_) => "CONFLICT",
        JournalRecord::CursorAdvanced { .. } => "CURSOR",
        JournalRecord::StatusUpdated(_) => "STATUS",
        JournalRecord::BatchBegin { .. } => "BEGIN",
        JournalRecord::BatchCommit { .. } => "COMMIT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_store::InMemoryBackend;

    fn backend_with(records: &[JournalRecord]) -> InMemoryBackend {
        let mut data = Vec::new();
        for record in records {
            data.extend(record.encode_frame().unwrap());
        }
        InMemoryBackend::with_data(data)
    }

    #[test]
    fn scans_all_frames() {
        let backend = backend_with(&[
            JournalRecord::TableCreated(Table::OfflineQueue),
            JournalRecord::BatchBegin { batch_id: 1 },
            JournalRecord::BatchCommit { batch_id: 1 },
        ]);

        let scan = scan(&backend).unwrap();
        assert_eq!(scan.frames.len(), 3);
        assert_eq!(scan.valid_len, scan.size);
        assert!(scan.stop.is_none());
        assert_eq!(scan.frames[0].offset, 0);
        assert_eq!(record_kind(&scan.frames[1].record), "BEGIN");
    }

    #[test]
    fn torn_tail_stops_scan() {
        let first = JournalRecord::TableCreated(Table::DataSync)
            .encode_frame()
            .unwrap();
        let second = JournalRecord::BatchBegin { batch_id: 7 }
            .encode_frame()
            .unwrap();
        let mut data = first.clone();
        data.extend_from_slice(&second[..second.len() - 3]);

        let scan = scan(&InMemoryBackend::with_data(data)).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert_eq!(scan.valid_len, first.len() as u64);
        let stop = scan.stop.unwrap();
        assert!(stop.torn);
        assert_eq!(stop.offset, first.len() as u64);
    }

    #[test]
    fn checksum_mismatch_before_tail_is_corruption() {
        let mut data = JournalRecord::TableCreated(Table::SyncConflicts)
            .encode_frame()
            .unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let torn_only = data.clone();
        data.extend(
            JournalRecord::TableCreated(Table::DataSync)
                .encode_frame()
                .unwrap(),
        );

        let scan_mid = scan(&InMemoryBackend::with_data(data)).unwrap();
        assert!(scan_mid.frames.is_empty());
        let stop = scan_mid.stop.unwrap();
        assert!(!stop.torn);
        assert!(stop.reason.contains("checksum"));

        let scan_tail = scan(&InMemoryBackend::with_data(torn_only)).unwrap();
        assert!(scan_tail.stop.unwrap().torn);
    }
}
