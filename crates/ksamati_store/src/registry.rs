//! Device registry: the `device_sync_status` table.

use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, JournalRecord};
use chrono::Utc;
use ksamati_sync_protocol::{DeviceCursor, DeviceId, DeviceStatus};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    cursors: BTreeMap<DeviceId, DeviceCursor>,
    statuses: BTreeMap<DeviceId, DeviceStatus>,
}

impl RegistryState {
    pub(crate) fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::CursorAdvanced {
                device_id,
                cursor,
                remote_cursor,
            } => {
                let row = self
                    .cursors
                    .entry(device_id.clone())
                    .or_insert_with(|| DeviceCursor::new(device_id.clone()));
                row.cursor = row.cursor.max(*cursor);
                row.remote_cursor = row.remote_cursor.max(*remote_cursor);
            }
            JournalRecord::StatusUpdated(status) => {
                self.statuses
                    .insert(status.device_id.clone(), status.clone());
            }
            _ => {}
        }
    }

    pub(crate) fn cursor(&self, device_id: &DeviceId) -> DeviceCursor {
        self.cursors
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| DeviceCursor::new(device_id.clone()))
    }

    pub(crate) fn status(&self, device_id: &DeviceId) -> DeviceStatus {
        self.statuses.get(device_id).cloned().unwrap_or_else(|| {
            let mut status = DeviceStatus::new(device_id.clone());
            status.last_sync_cursor = self.cursor(device_id).cursor;
            status
        })
    }

    pub(crate) fn rows(&self) -> usize {
        self.devices().len()
    }

    pub(crate) fn devices(&self) -> BTreeSet<DeviceId> {
        self.cursors
            .keys()
            .chain(self.statuses.keys())
            .cloned()
            .collect()
    }
}

/// Per-device cursor and sync status.
///
/// The cursor only moves forward. Advancing to the current value is a
/// no-op; advancing to a smaller value is rejected with
/// [`StoreError::OutOfOrder`].
#[derive(Debug)]
pub struct DeviceRegistry {
    journal: Arc<Journal>,
    pub(crate) state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    pub(crate) fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Returns the highest local seq settled for a device, or 0.
    pub fn get_cursor(&self, device_id: &DeviceId) -> u64 {
        self.state.read().cursor(device_id).cursor
    }

    /// Returns the central feed position pulled by a device, or 0.
    pub fn remote_cursor(&self, device_id: &DeviceId) -> u64 {
        self.state.read().cursor(device_id).remote_cursor
    }

    /// Returns both cursors of a device.
    pub fn cursor_row(&self, device_id: &DeviceId) -> DeviceCursor {
        self.state.read().cursor(device_id)
    }

    /// Moves the local cursor of a device forward.
    pub fn advance_cursor(&self, device_id: &DeviceId, seq: u64) -> StoreResult<()> {
        let mut state = self.state.write();
        let current = state.cursor(device_id);
        if seq < current.cursor {
            tracing::warn!(
                device = %device_id,
                current = current.cursor,
                attempted = seq,
                "cursor regression rejected"
            );
            return Err(StoreError::OutOfOrder {
                device_id: device_id.clone(),
                current: current.cursor,
                attempted: seq,
            });
        }
        if seq == current.cursor {
            return Ok(());
        }
        let record = JournalRecord::CursorAdvanced {
            device_id: device_id.clone(),
            cursor: seq,
            remote_cursor: current.remote_cursor,
        };
        self.journal.append(&record)?;
        state.apply(&record);
        Ok(())
    }

    /// Returns the status row of a device.
    ///
    /// A device that never synced reports cursor 0 and no timestamps.
    pub fn status(&self, device_id: &DeviceId) -> DeviceStatus {
        self.state.read().status(device_id)
    }

    /// Returns the status rows of every known device.
    pub fn statuses(&self) -> Vec<DeviceStatus> {
        let state = self.state.read();
        state
            .devices()
            .iter()
            .map(|device| state.status(device))
            .collect()
    }

    /// Returns every device with a cursor or status row.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.state.read().devices().into_iter().collect()
    }

    /// Records a failed cycle. Cursor and pending count stay as they were.
    pub fn record_failure(&self, device_id: &DeviceId, error: &str) -> StoreResult<DeviceStatus> {
        let mut state = self.state.write();
        let mut status = state.status(device_id);
        status.record_failure(error, Utc::now());
        let record = JournalRecord::StatusUpdated(status.clone());
        self.journal.append(&record)?;
        state.apply(&record);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use proptest::prelude::*;

    fn registry() -> DeviceRegistry {
        let journal = Journal::new(Box::new(InMemoryBackend::new()), false, false);
        DeviceRegistry::new(Arc::new(journal))
    }

    #[test]
    fn unknown_device_starts_at_zero() {
        let registry = registry();
        let device = DeviceId::new("new-phone");
        assert_eq!(registry.get_cursor(&device), 0);
        assert_eq!(registry.remote_cursor(&device), 0);
        let status = registry.status(&device);
        assert_eq!(status.last_sync_cursor, 0);
        assert!(status.last_seen_at.is_none());
        assert!(registry.devices().is_empty());
    }

    #[test]
    fn cursor_moves_forward_only() {
        let registry = registry();
        let device = DeviceId::new("site-laptop");

        registry.advance_cursor(&device, 5).unwrap();
        registry.advance_cursor(&device, 5).unwrap();
        assert_eq!(registry.get_cursor(&device), 5);

        let err = registry.advance_cursor(&device, 3).unwrap_err();
        assert!(matches!(
            err,
            StoreError::OutOfOrder {
                current: 5,
                attempted: 3,
                ..
            }
        ));
        assert_eq!(registry.get_cursor(&device), 5);

        registry.advance_cursor(&device, 9).unwrap();
        assert_eq!(registry.get_cursor(&device), 9);
        assert_eq!(registry.devices(), vec![device]);
    }

    #[test]
    fn failures_accumulate() {
        let registry = registry();
        let device = DeviceId::new("site-laptop");
        registry.advance_cursor(&device, 4).unwrap();

        registry.record_failure(&device, "timeout").unwrap();
        let status = registry.record_failure(&device, "offline").unwrap();

        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("offline"));
        assert_eq!(registry.get_cursor(&device), 4);
        assert_eq!(registry.statuses().len(), 1);
    }

    proptest! {
        #[test]
        fn cursor_never_decreases(attempts in prop::collection::vec(0u64..50, 1..30)) {
            let registry = registry();
            let device = DeviceId::new("site-laptop");
            let mut high = 0;
            for seq in attempts {
                let result = registry.advance_cursor(&device, seq);
                if seq < high {
                    prop_assert!(result.is_err());
                } else {
                    prop_assert!(result.is_ok());
                    high = seq;
                }
                prop_assert_eq!(registry.get_cursor(&device), high);
            }
        }
    }
}
