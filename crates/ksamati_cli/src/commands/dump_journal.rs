//! Dump journal command implementation.

use crate::frames::{open_journal, record_kind, scan, Frame};
use crate::Format;
use ksamati_store::{JournalRecord, Table};
use serde::Serialize;
use std::path::Path;

/// Journal frame representation for output.
#[derive(Debug, Serialize)]
pub struct FrameInfo {
    /// Offset in the journal file.
    pub offset: u64,
    /// Table the frame belongs to.
    pub table: &'static str,
    /// Record kind.
    pub kind: &'static str,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// One-line summary.
    pub summary: String,
    /// The full record (JSON output only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<JournalRecord>,
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    table: Option<&str>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let table = table.map(parse_table).transpose()?;
    let backend = open_journal(path)?;
    let scan = scan(&backend)?;

    let frames: Vec<FrameInfo> = scan
        .frames
        .into_iter()
        .filter(|f| table.map_or(true, |t| f.table == t))
        .take(limit.unwrap_or(usize::MAX))
        .map(|f| describe(f, format == Format::Json))
        .collect();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&frames)?),
        Format::Text => {
            print_text_output(&frames);
            if let Some(stop) = &scan.stop {
                println!();
                println!("Stopped at offset {}: {}", stop.offset, stop.reason);
            }
        }
    }
    Ok(())
}

fn parse_table(name: &str) -> Result<Table, Box<dyn std::error::Error>> {
    [
        Table::OfflineQueue,
        Table::DataSync,
        Table::SyncConflicts,
        Table::DeviceSyncStatus,
        Table::Control,
    ]
    .into_iter()
    .find(|t| t.name() == name)
    .ok_or_else(|| format!("Unknown table: {}", name).into())
}

fn describe(frame: Frame, keep_record: bool) -> FrameInfo {
    let summary = match &frame.record {
        JournalRecord::TableCreated(table) => format!("table={}", table),
        JournalRecord::ChangeAppended(entry) => format!(
            "device={} seq={} {} {} v{}",
            entry.device_id,
            entry.seq,
            entry.operation,
            entry.key(),
            entry.local_version
        ),
        JournalRecord::ChangeIncoming {
            entry,
            server_version,
        } => format!(
            "device={} {} {} server_v{}",
            entry.device_id,
            entry.operation,
            entry.key(),
            server_version
        ),
        JournalRecord::ChangeSettled {
            entry_id,
            server_version,
            ..
        } => match server_version {
            Some(v) => format!("entry={} server_v{}", entry_id, v),
            None => format!("entry={} discarded", entry_id),
        },
        JournalRecord::ConflictUpserted(conflict) => format!(
            "conflict={} {} local_v{} remote_v{} resolution={}",
            conflict.id,
            conflict.key(),
            conflict.local_version,
            conflict.remote_version,
            conflict.resolution
        ),
        JournalRecord::CursorAdvanced {
            device_id,
            cursor,
            remote_cursor,
        } => format!(
            "device={} cursor={} remote_cursor={}",
            device_id, cursor, remote_cursor
        ),
        JournalRecord::StatusUpdated(status) => format!(
            "device={} pending={} failures={}",
            status.device_id, status.pending_count, status.consecutive_failures
        ),
        JournalRecord::BatchBegin { batch_id } | JournalRecord::BatchCommit { batch_id } => {
            format!("batch={}", batch_id)
        }
    };

    FrameInfo {
        offset: frame.offset,
        table: frame.table.name(),
        kind: record_kind(&frame.record),
        payload_size: frame.payload_size,
        summary,
        record: keep_record.then_some(frame.record),
    }
}

fn print_text_output(frames: &[FrameInfo]) {
    println!("Journal Frames ({} shown)", frames.len());
    println!("=====================");
    println!();

    for frame in frames {
        println!(
            "[{:08}] {:8} {:18} {}",
            frame.offset, frame.kind, frame.table, frame.summary
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_store::{StoreConfig, SyncStore};
    use ksamati_sync_protocol::{DeviceId, NewChange};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn table_names_parse() {
        assert_eq!(parse_table("offline_queue").unwrap(), Table::OfflineQueue);
        assert_eq!(parse_table("control").unwrap(), Table::Control);
        assert!(parse_table("segments").is_err());
    }

    #[test]
    fn dumps_store_journal() {
        let dir = tempdir().unwrap();
        {
            let store = SyncStore::open(dir.path(), StoreConfig::default()).unwrap();
            store
                .change_log()
                .append(NewChange::delete(
                    DeviceId::new("tablet"),
                    "expense",
                    "E-4",
                    2,
                ))
                .unwrap();
        }

        let backend = open_journal(dir.path()).unwrap();
        let appended = scan(&backend)
            .unwrap()
            .frames
            .into_iter()
            .find(|f| f.table == Table::OfflineQueue)
            .map(|f| describe(f, false))
            .unwrap();
        assert_eq!(appended.kind, "APPEND");
        assert!(appended.summary.contains("expense/E-4"));
        assert!(appended.record.is_none());

        assert!(run(dir.path(), Some(1), Some("offline_queue"), Format::Json).is_ok());
        assert!(run(dir.path(), None, Some("bogus"), Format::Text).is_err());
    }
}
