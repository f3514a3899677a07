//! Conflicts command implementation.

use super::{format_time, open_store};
use crate::Format;
use ksamati_sync_protocol::SyncConflict;
use std::path::Path;

/// Runs the conflicts command.
pub fn run(
    path: &Path,
    include_closed: bool,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let conflicts = if include_closed {
        store.conflicts().all()
    } else {
        store.conflicts().open()
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&conflicts)?),
        Format::Text => print_text_output(&conflicts, include_closed),
    }
    Ok(())
}

fn print_text_output(conflicts: &[SyncConflict], include_closed: bool) {
    if conflicts.is_empty() {
        if include_closed {
            println!("No conflicts");
        } else {
            println!("No open conflicts");
        }
        return;
    }

    println!("Conflicts ({} total)", conflicts.len());
    println!("===================");
    println!();
    for conflict in conflicts {
        let state = if conflict.is_undecided() {
            "AWAITING DECISION"
        } else if conflict.awaits_delivery() {
            "AWAITING DELIVERY"
        } else {
            "closed"
        };
        println!("{} [{}]", conflict.id, state);
        println!("  Entity:      {}", conflict.key());
        println!("  Device:      {}", conflict.device_id);
        println!("  Entry:       {}", conflict.entry_id);
        println!(
            "  Versions:    local v{}, remote v{}",
            conflict.local_version, conflict.remote_version
        );
        println!("  Resolution:  {}", conflict.resolution);
        println!("  Detected:    {}", format_time(Some(conflict.detected_at)));
        println!("  Resolved:    {}", format_time(conflict.resolved_at));
        println!();
    }
}
