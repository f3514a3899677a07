//! Devices command implementation.

use super::{format_time, open_store};
use crate::Format;
use ksamati_sync_protocol::DeviceStatus;
use std::path::Path;

/// Runs the devices command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let statuses = store.device_statuses();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
        Format::Text => print_text_output(&statuses),
    }
    Ok(())
}

fn print_text_output(statuses: &[DeviceStatus]) {
    if statuses.is_empty() {
        println!("No devices");
        return;
    }

    println!(
        "{:20} {:>8} {:>8} {:20} {:>8}",
        "DEVICE", "CURSOR", "PENDING", "LAST SUCCESS", "FAILURES"
    );
    for status in statuses {
        println!(
            "{:20} {:>8} {:>8} {:20} {:>8}",
            status.device_id.as_str(),
            status.last_sync_cursor,
            status.pending_count,
            format_time(status.last_success_at),
            status.consecutive_failures
        );
        if let Some(error) = &status.last_error {
            println!("  last error: {}", error);
        }
    }
}
