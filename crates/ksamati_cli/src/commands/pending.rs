//! Pending command implementation.

use super::{format_time, open_store};
use crate::Format;
use ksamati_sync_protocol::{ChangeEntry, DeviceId};
use serde::Serialize;
use std::path::Path;

/// Pending entries of one device.
#[derive(Debug, Serialize)]
pub struct DevicePending {
    /// Device id.
    pub device_id: DeviceId,
    /// Pending entries in the device.
    pub pending_count: u64,
    /// Entries shown, oldest first.
    pub entries: Vec<ChangeEntry>,
}

/// Runs the pending command.
pub fn run(
    path: &Path,
    device: Option<&str>,
    limit: Option<usize>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let result = collect(&store, device, limit.unwrap_or(usize::MAX));

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

pub(crate) fn collect(
    store: &ksamati_store::SyncStore,
    device: Option<&str>,
    limit: usize,
) -> Vec<DevicePending> {
    store
        .device_statuses()
        .into_iter()
        .filter(|s| device.map_or(true, |d| s.device_id.as_str() == d))
        .filter(|s| s.pending_count > 0)
        .map(|s| DevicePending {
            entries: store.change_log().drain(&s.device_id, limit),
            pending_count: s.pending_count,
            device_id: s.device_id,
        })
        .collect()
}

fn print_text_output(result: &[DevicePending]) {
    if result.is_empty() {
        println!("No pending entries");
        return;
    }

    for device in result {
        println!(
            "Device {} ({} pending)",
            device.device_id, device.pending_count
        );
        for entry in &device.entries {
            println!(
                "  [{:06}] {:6} {:30} v{:<4} {}  {}",
                entry.seq,
                entry.operation.as_str(),
                entry.key().to_string(),
                entry.local_version,
                format_time(Some(entry.created_at)),
                entry.id
            );
        }
        if (device.entries.len() as u64) < device.pending_count {
            println!(
                "  ... {} more",
                device.pending_count - device.entries.len() as u64
            );
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_store::SyncStore;
    use ksamati_sync_protocol::NewChange;
    use serde_json::json;

    #[test]
    fn groups_by_device() {
        let store = SyncStore::in_memory().unwrap();
        for (device, id) in [("tablet", "C-1"), ("tablet", "C-2"), ("laptop", "E-1")] {
            store
                .change_log()
                .append(NewChange::create(
                    DeviceId::new(device),
                    "contract",
                    id,
                    json!({}),
                ))
                .unwrap();
        }

        let all = collect(&store, None, usize::MAX);
        assert_eq!(all.len(), 2);

        let tablet = collect(&store, Some("tablet"), 1);
        assert_eq!(tablet.len(), 1);
        assert_eq!(tablet[0].pending_count, 2);
        assert_eq!(tablet[0].entries.len(), 1);
        assert_eq!(tablet[0].entries[0].entity_id, "C-1");
    }
}
