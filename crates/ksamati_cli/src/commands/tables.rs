//! Tables command implementation.

use super::open_store;
use crate::Format;
use ksamati_store::StoreReport;
use std::path::Path;

/// Runs the tables command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let report = store.report()?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_text_output(&report),
    }

    if !report.missing_tables().is_empty() {
        return Err(format!("Missing tables: {}", report.missing_tables().join(", ")).into());
    }
    Ok(())
}

fn print_text_output(report: &StoreReport) {
    println!("KSAMATI Sync Store");
    println!("==================");
    println!();
    if let Some(path) = &report.path {
        println!("Path: {}", path.display());
        println!();
    }
    println!("Tables:");
    for table in &report.tables {
        let state = if table.exists { "ok" } else { "MISSING" };
        println!("  {:20} {:8} {} rows", table.name, state, table.rows);
    }
    println!();
    println!("Sync:");
    println!("  Pending entries: {}", report.pending_entries);
    println!("  Open conflicts:  {}", report.open_conflicts);
    println!();
    println!("Journal:");
    println!("  Size:               {}", format_size(report.journal_bytes));
    println!("  Frames:             {}", report.frames);
    println!("  Discarded batches:  {}", report.discarded_batches);
    if report.torn_bytes > 0 {
        println!(
            "  Torn tail:          {} bytes (truncated on next writable open)",
            report.torn_bytes
        );
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_store::{StoreConfig, SyncStore};
    use tempfile::tempdir;

    #[test]
    fn reports_fresh_store() {
        let dir = tempdir().unwrap();
        drop(SyncStore::open(dir.path(), StoreConfig::default()).unwrap());

        assert!(run(dir.path(), Format::Json).is_ok());
        assert!(run(dir.path(), Format::Text).is_ok());
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(run(&dir.path().join("absent"), Format::Text).is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
