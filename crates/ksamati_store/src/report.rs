//! Table existence and health report.

use serde::Serialize;
use std::path::PathBuf;

/// One sync table in a [`StoreReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    /// Table name.
    pub name: &'static str,
    /// Whether the table was provisioned.
    pub exists: bool,
    /// Number of rows.
    pub rows: usize,
}

/// Snapshot of a store's tables and journal health.
#[derive(Debug, Clone, Serialize)]
pub struct StoreReport {
    /// Store directory, if file-backed.
    pub path: Option<PathBuf>,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Frames read at open.
    pub frames: u64,
    /// Bytes after the last committed frame when the store was opened.
    pub torn_bytes: u64,
    /// Uncommitted batches found at open.
    pub discarded_batches: u64,
    /// The four sync tables.
    pub tables: Vec<TableReport>,
    /// Outgoing entries still pending, across devices.
    pub pending_entries: usize,
    /// Conflicts not yet closed.
    pub open_conflicts: usize,
}

impl StoreReport {
    /// Returns the names of tables that were never provisioned.
    pub fn missing_tables(&self) -> Vec<&'static str> {
        self.tables
            .iter()
            .filter(|t| !t.exists)
            .map(|t| t.name)
            .collect()
    }

    /// Returns true if every table exists and the journal had no torn tail.
    pub fn is_healthy(&self) -> bool {
        self.torn_bytes == 0 && self.tables.iter().all(|t| t.exists)
    }
}
