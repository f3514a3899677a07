//! CLI command implementations.

pub mod conflicts;
pub mod devices;
pub mod dump_journal;
pub mod pending;
pub mod tables;
pub mod verify;

use chrono::{DateTime, Utc};
use ksamati_store::SyncStore;
use std::path::Path;

/// Opens a store for reporting.
pub(crate) fn open_store(path: &Path) -> Result<SyncStore, Box<dyn std::error::Error>> {
    SyncStore::open_read_only(path)
        .map_err(|e| format!("Cannot open store at {:?}: {}", path, e).into())
}

pub(crate) fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}
