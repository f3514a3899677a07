//! Verify command implementation.

use super::open_store;
use crate::frames::{open_journal, scan, Scan};
use crate::Format;
use ksamati_store::JournalRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Number of frames checked.
    pub frames_checked: usize,
    /// Frames per table.
    pub frames_by_table: BTreeMap<&'static str, usize>,
    /// Batches with a commit frame.
    pub committed_batches: usize,
    /// Batches without a commit frame; dropped on open.
    pub uncommitted_batches: usize,
    /// Bytes after the last readable frame.
    pub torn_bytes: u64,
    /// Problems that are expected after a crash.
    pub warnings: Vec<String>,
    /// Problems that make the journal unreadable.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_journal(path)?;
    let mut result = verify(&scan(&backend)?);

    // Replay the journal the way a writer would open it.
    if result.is_ok() {
        if let Err(e) = open_store(path) {
            result.errors.push(e.to_string());
        }
    }
    tracing::debug!(
        frames = result.frames_checked,
        errors = result.errors.len(),
        "journal verified"
    );

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(path, &result),
    }

    if result.is_ok() {
        Ok(())
    } else {
        Err("Verification failed".into())
    }
}

/// Checks frame sequencing and batch structure.
pub fn verify(scan: &Scan) -> VerifyResult {
    let mut result = VerifyResult {
        frames_checked: scan.frames.len(),
        torn_bytes: scan.size - scan.valid_len,
        ..VerifyResult::default()
    };
    let mut open_batch: Option<(u64, u64)> = None;

    for frame in &scan.frames {
        *result
            .frames_by_table
            .entry(frame.table.name())
            .or_default() += 1;

        match &frame.record {
            JournalRecord::BatchBegin { batch_id } => {
                if let Some((open_id, _)) = open_batch {
                    result.errors.push(format!(
                        "Batch {} opened at offset {} inside batch {}",
                        batch_id, frame.offset, open_id
                    ));
                }
                open_batch = Some((*batch_id, frame.offset));
            }
            JournalRecord::BatchCommit { batch_id } => match open_batch.take() {
                Some((open_id, _)) if open_id == *batch_id => result.committed_batches += 1,
                _ => result.errors.push(format!(
                    "Commit for unknown batch {} at offset {}",
                    batch_id, frame.offset
                )),
            },
            _ => {}
        }
    }

    if let Some((batch_id, offset)) = open_batch {
        result.uncommitted_batches += 1;
        result.warnings.push(format!(
            "Batch {} at offset {} has no commit frame and is ignored",
            batch_id, offset
        ));
    }

    match &scan.stop {
        Some(stop) if stop.torn => result.warnings.push(format!(
            "Torn tail at offset {} ({}): {} bytes dropped on next writable open",
            stop.offset, stop.reason, result.torn_bytes
        )),
        Some(stop) => result.errors.push(format!(
            "Corrupt frame at offset {}: {}",
            stop.offset, stop.reason
        )),
        None => {}
    }

    result
}

fn print_text_output(path: &Path, result: &VerifyResult) {
    println!("Verifying store at {:?}", path);
    println!();
    println!("  Frames checked:      {}", result.frames_checked);
    for (table, count) in &result.frames_by_table {
        println!("    {:20} {}", table, count);
    }
    println!("  Committed batches:   {}", result.committed_batches);
    println!("  Uncommitted batches: {}", result.uncommitted_batches);

    if !result.warnings.is_empty() {
        println!();
        println!("  Warnings:");
        for warning in &result.warnings {
            println!("    - {}", warning);
        }
    }
    if !result.errors.is_empty() {
        println!();
        println!("  Errors:");
        for error in &result.errors {
            println!("    - {}", error);
        }
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
    } else {
        println!("✗ Journal verification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_store::{journal_path, InMemoryBackend, StoreConfig, SyncStore, Table};
    use ksamati_sync_protocol::{DeviceId, NewChange};
    use serde_json::json;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn frames(records: &[JournalRecord]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|r| r.encode_frame().unwrap())
            .collect()
    }

    #[test]
    fn healthy_store_passes() {
        let dir = tempdir().unwrap();
        {
            let store = SyncStore::open(dir.path(), StoreConfig::default()).unwrap();
            store
                .change_log()
                .append(NewChange::create(
                    DeviceId::new("tablet"),
                    "contract",
                    "C-1",
                    json!({"title": "Bridge"}),
                ))
                .unwrap();
        }

        assert!(run(dir.path(), Format::Text).is_ok());
        let backend = open_journal(dir.path()).unwrap();
        let result = verify(&scan(&backend).unwrap());
        assert_eq!(result.frames_by_table.get("offline_queue"), Some(&1));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn torn_tail_is_a_warning() {
        let dir = tempdir().unwrap();
        drop(SyncStore::open(dir.path(), StoreConfig::default()).unwrap());
        let mut file = OpenOptions::new()
            .append(true)
            .open(journal_path(dir.path()))
            .unwrap();
        file.write_all(b"KSJR\x01").unwrap();
        drop(file);

        let backend = open_journal(dir.path()).unwrap();
        let result = verify(&scan(&backend).unwrap());
        assert!(result.is_ok());
        assert_eq!(result.torn_bytes, 5);
        assert_eq!(result.warnings.len(), 1);
        assert!(run(dir.path(), Format::Json).is_ok());
    }

    #[test]
    fn uncommitted_batch_is_a_warning() {
        let data = frames(&[
            JournalRecord::TableCreated(Table::OfflineQueue),
            JournalRecord::BatchBegin { batch_id: 3 },
            JournalRecord::TableCreated(Table::DataSync),
        ]);
        let result = verify(&scan(&InMemoryBackend::with_data(data)).unwrap());
        assert!(result.is_ok());
        assert_eq!(result.uncommitted_batches, 1);
        assert_eq!(result.committed_batches, 0);
    }

    #[test]
    fn mismatched_commit_is_an_error() {
        let data = frames(&[
            JournalRecord::BatchBegin { batch_id: 1 },
            JournalRecord::BatchCommit { batch_id: 2 },
        ]);
        let result = verify(&scan(&InMemoryBackend::with_data(data)).unwrap());
        assert!(!result.is_ok());
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn garbage_is_an_error() {
        let mut data = frames(&[JournalRecord::TableCreated(Table::OfflineQueue)]);
        data.extend_from_slice(b"not a journal frame at all");
        let result = verify(&scan(&InMemoryBackend::with_data(data)).unwrap());
        assert!(!result.is_ok());
        assert_eq!(result.frames_checked, 1);
    }
}
