//! The `sync_conflicts` table.

use crate::error::StoreResult;
use crate::journal::{Journal, JournalRecord};
use ksamati_sync_protocol::{ConflictId, DeviceId, EntryId, SyncConflict};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct ConflictState {
    conflicts: HashMap<ConflictId, SyncConflict>,
    open_by_entry: HashMap<EntryId, ConflictId>,
}

impl ConflictState {
    pub(crate) fn apply(&mut self, record: &JournalRecord) {
        if let JournalRecord::ConflictUpserted(conflict) = record {
            if conflict.is_open() {
                self.open_by_entry.insert(conflict.entry_id, conflict.id);
            } else if self.open_by_entry.get(&conflict.entry_id) == Some(&conflict.id) {
                self.open_by_entry.remove(&conflict.entry_id);
            }
            self.conflicts.insert(conflict.id, conflict.clone());
        }
    }

    pub(crate) fn get(&self, id: &ConflictId) -> Option<&SyncConflict> {
        self.conflicts.get(id)
    }

    pub(crate) fn open_for_entry(&self, entry_id: &EntryId) -> Option<&SyncConflict> {
        self.open_by_entry
            .get(entry_id)
            .and_then(|id| self.conflicts.get(id))
    }

    fn sorted<'a>(iter: impl Iterator<Item = &'a SyncConflict>) -> Vec<SyncConflict> {
        let mut out: Vec<SyncConflict> = iter.cloned().collect();
        out.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub(crate) fn open_len(&self) -> usize {
        self.open_by_entry.len()
    }
}

/// Conflict records, one per detected divergence.
///
/// At most one conflict per entry is open at a time. Closed conflicts are
/// kept as history.
#[derive(Debug)]
pub struct ConflictStore {
    journal: Arc<Journal>,
    pub(crate) state: RwLock<ConflictState>,
}

impl ConflictStore {
    pub(crate) fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            state: RwLock::new(ConflictState::default()),
        }
    }

    /// Inserts or replaces a conflict record.
    pub fn upsert(&self, conflict: SyncConflict) -> StoreResult<()> {
        let mut state = self.state.write();
        let record = JournalRecord::ConflictUpserted(conflict);
        self.journal.append(&record)?;
        state.apply(&record);
        Ok(())
    }

    /// Returns a conflict by id.
    pub fn get(&self, id: &ConflictId) -> Option<SyncConflict> {
        self.state.read().get(id).cloned()
    }

    /// Returns the open conflict of an entry, if any.
    pub fn open_for_entry(&self, entry_id: &EntryId) -> Option<SyncConflict> {
        self.state.read().open_for_entry(entry_id).cloned()
    }

    /// Returns open conflicts of a device that nobody has decided yet,
    /// oldest first.
    pub fn pending(&self, device_id: &DeviceId) -> Vec<SyncConflict> {
        let state = self.state.read();
        ConflictState::sorted(
            state
                .conflicts
                .values()
                .filter(|c| &c.device_id == device_id && c.is_undecided()),
        )
    }

    /// Returns all open conflicts, oldest first.
    pub fn open(&self) -> Vec<SyncConflict> {
        let state = self.state.read();
        ConflictState::sorted(state.conflicts.values().filter(|c| c.is_open()))
    }

    /// Returns every conflict record, oldest first.
    pub fn all(&self) -> Vec<SyncConflict> {
        let state = self.state.read();
        ConflictState::sorted(state.conflicts.values())
    }

    /// Returns the number of conflict records.
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Returns true if no conflict was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use chrono::{Duration, Utc};
    use ksamati_sync_protocol::{ChangeEntry, NewChange, RemoteState, Resolution};
    use serde_json::json;

    fn store() -> ConflictStore {
        let journal = Journal::new(Box::new(InMemoryBackend::new()), false, false);
        ConflictStore::new(Arc::new(journal))
    }

    fn conflict(device: &str, minutes_ago: i64) -> SyncConflict {
        let entry = ChangeEntry::from_new(
            NewChange::update(DeviceId::new(device), "budget", "B-1", 1, json!({"amount": 10})),
            1,
            Utc::now(),
        );
        let remote = RemoteState {
            version: 2,
            payload: Some(json!({"amount": 12})),
            deleted: false,
            created_at: Some(Utc::now()),
        };
        SyncConflict::pending(&entry, &remote, Utc::now() - Duration::minutes(minutes_ago))
    }

    #[test]
    fn pending_lists_undecided_for_device_oldest_first() {
        let store = store();
        let newer = conflict("tablet", 1);
        let older = conflict("tablet", 10);
        let elsewhere = conflict("phone", 5);
        store.upsert(newer.clone()).unwrap();
        store.upsert(older.clone()).unwrap();
        store.upsert(elsewhere).unwrap();

        let pending = store.pending(&DeviceId::new("tablet"));
        let ids: Vec<ConflictId> = pending.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
        assert_eq!(store.open().len(), 3);
    }

    #[test]
    fn decided_and_closed_conflicts_leave_pending() {
        let store = store();
        let mut c = conflict("tablet", 0);
        store.upsert(c.clone()).unwrap();
        assert_eq!(store.open_for_entry(&c.entry_id).unwrap().id, c.id);

        c.decide(Resolution::LocalWins, None);
        store.upsert(c.clone()).unwrap();
        assert!(store.pending(&DeviceId::new("tablet")).is_empty());
        assert!(store.open_for_entry(&c.entry_id).is_some());

        c.close(Utc::now());
        store.upsert(c.clone()).unwrap();
        assert!(store.open_for_entry(&c.entry_id).is_none());
        assert_eq!(store.get(&c.id).unwrap().resolution, Resolution::LocalWins);
        assert_eq!(store.len(), 1);
        assert!(store.open().is_empty());
    }
}
