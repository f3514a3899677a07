//! The change log: outgoing `offline_queue` entries and incoming
//! `data_sync` entries.

use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, JournalRecord};
use chrono::{DateTime, Utc};
use ksamati_sync_protocol::{ChangeEntry, DeviceId, EntityKey, EntryId, NewChange, RemoteChange};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// The pending range of one device, frozen at a point in time.
///
/// Entries appended after the snapshot carry a larger seq and are not part
/// of the cycle that took it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSnapshot {
    /// Highest seq assigned to the device when the snapshot was taken.
    pub high_water: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ChangeLogState {
    entries: HashMap<EntryId, ChangeEntry>,
    /// Outgoing entries still pending, by device and seq.
    pending: HashMap<DeviceId, BTreeMap<u64, EntryId>>,
    /// Highest seq assigned per device.
    last_seq: HashMap<DeviceId, u64>,
    /// Highest server version known per entity.
    known_versions: HashMap<EntityKey, u64>,
    incoming: HashSet<EntryId>,
    outgoing: usize,
}

impl ChangeLogState {
    pub(crate) fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::ChangeAppended(entry) => {
                let last = self.last_seq.entry(entry.device_id.clone()).or_insert(0);
                *last = (*last).max(entry.seq);
                if entry.is_pending() {
                    self.pending
                        .entry(entry.device_id.clone())
                        .or_default()
                        .insert(entry.seq, entry.id);
                }
                self.outgoing += 1;
                self.entries.insert(entry.id, entry.clone());
            }
            JournalRecord::ChangeIncoming {
                entry,
                server_version,
            } => {
                self.bump_version(entry.key(), *server_version);
                self.incoming.insert(entry.id);
                self.entries.insert(entry.id, entry.clone());
            }
            JournalRecord::ChangeSettled {
                entry_id,
                synced_at,
                server_version,
            } => {
                let Some(entry) = self.entries.get_mut(entry_id) else {
                    return;
                };
                if entry.synced_at.is_none() {
                    entry.synced_at = Some(*synced_at);
                }
                let key = entry.key();
                if let Some(queue) = self.pending.get_mut(&entry.device_id) {
                    queue.remove(&entry.seq);
                }
                if let Some(version) = server_version {
                    self.bump_version(key, *version);
                }
            }
            _ => {}
        }
    }

    fn bump_version(&mut self, key: EntityKey, version: u64) {
        let known = self.known_versions.entry(key).or_insert(0);
        *known = (*known).max(version);
    }

    pub(crate) fn get(&self, id: &EntryId) -> Option<&ChangeEntry> {
        self.entries.get(id)
    }

    pub(crate) fn contains(&self, id: &EntryId) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn pending_count(&self, device_id: &DeviceId) -> u64 {
        self.pending.get(device_id).map_or(0, |q| q.len() as u64)
    }

    pub(crate) fn last_seq(&self, device_id: &DeviceId) -> u64 {
        self.last_seq.get(device_id).copied().unwrap_or(0)
    }

    fn range(
        &self,
        device_id: &DeviceId,
        after_seq: u64,
        high_water: u64,
        limit: usize,
    ) -> Vec<ChangeEntry> {
        let Some(queue) = self.pending.get(device_id) else {
            return Vec::new();
        };
        if after_seq >= high_water {
            return Vec::new();
        }
        queue
            .range(after_seq + 1..=high_water)
            .take(limit)
            .filter_map(|(_, id)| self.entries.get(id).cloned())
            .collect()
    }

    pub(crate) fn outgoing_len(&self) -> usize {
        self.outgoing
    }

    pub(crate) fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    pub(crate) fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.last_seq.keys()
    }
}

/// Append-only log of entity mutations.
///
/// Appends are journaled before they become visible; an entry returned by
/// [`append`](Self::append) survives a crash. Within one device, entries are
/// drained in the order they were appended.
#[derive(Debug)]
pub struct ChangeLogStore {
    journal: Arc<Journal>,
    pub(crate) state: RwLock<ChangeLogState>,
}

impl ChangeLogStore {
    pub(crate) fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            state: RwLock::new(ChangeLogState::default()),
        }
    }

    /// Validates and durably appends a local change.
    ///
    /// The entry gets a fresh id, the next seq for its device and a
    /// `created_at` of now unless the change carries one.
    pub fn append(&self, change: NewChange) -> StoreResult<ChangeEntry> {
        change.validate()?;
        let mut state = self.state.write();
        let seq = state.last_seq(&change.device_id) + 1;
        let entry = ChangeEntry::from_new(change, seq, Utc::now());
        let record = JournalRecord::ChangeAppended(entry.clone());
        self.journal.append(&record)?;
        state.apply(&record);

        tracing::debug!(
            device = %entry.device_id,
            seq,
            entity = %entry.key(),
            operation = %entry.operation,
            "change appended"
        );
        Ok(entry)
    }

    /// Returns up to `limit` pending entries of a device, in seq order.
    pub fn drain(&self, device_id: &DeviceId, limit: usize) -> Vec<ChangeEntry> {
        let state = self.state.read();
        state.range(device_id, 0, u64::MAX, limit)
    }

    /// Freezes the pending range of a device.
    pub fn snapshot(&self, device_id: &DeviceId) -> DrainSnapshot {
        DrainSnapshot {
            high_water: self.state.read().last_seq(device_id),
        }
    }

    /// Returns up to `limit` pending entries with `after_seq < seq <= high_water`.
    pub fn drain_range(
        &self,
        device_id: &DeviceId,
        snapshot: DrainSnapshot,
        after_seq: u64,
        limit: usize,
    ) -> Vec<ChangeEntry> {
        let state = self.state.read();
        state.range(device_id, after_seq, snapshot.high_water, limit)
    }

    /// Marks an entry as settled.
    ///
    /// Returns `false` if it was already settled; repeating the call changes
    /// nothing.
    pub fn mark_synced(&self, entry_id: &EntryId) -> StoreResult<bool> {
        self.settle(entry_id, None, Utc::now())
    }

    pub(crate) fn settle(
        &self,
        entry_id: &EntryId,
        server_version: Option<u64>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write();
        let entry = state
            .get(entry_id)
            .ok_or(StoreError::UnknownEntry(*entry_id))?;
        if !entry.is_pending() {
            return Ok(false);
        }
        let record = JournalRecord::ChangeSettled {
            entry_id: *entry_id,
            synced_at: at,
            server_version,
        };
        self.journal.append(&record)?;
        state.apply(&record);
        Ok(true)
    }

    /// Records changes received from the central store.
    ///
    /// Changes whose id is already in the log are skipped. Returns the
    /// number recorded.
    pub fn record_incoming(&self, changes: &[RemoteChange]) -> StoreResult<usize> {
        let mut state = self.state.write();
        let records = incoming_records(&state, changes, Utc::now());
        if records.is_empty() {
            return Ok(0);
        }
        self.journal.append_batch(&records)?;
        for record in &records {
            state.apply(record);
        }
        Ok(records.len())
    }

    /// Returns an entry by id.
    pub fn get(&self, entry_id: &EntryId) -> Option<ChangeEntry> {
        self.state.read().get(entry_id).cloned()
    }

    /// Returns the number of pending entries of a device.
    pub fn pending_count(&self, device_id: &DeviceId) -> u64 {
        self.state.read().pending_count(device_id)
    }

    /// Returns the highest server version known for an entity, or 0.
    pub fn known_version(&self, key: &EntityKey) -> u64 {
        self.state
            .read()
            .known_versions
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of outgoing entries ever appended.
    pub fn len(&self) -> usize {
        self.state.read().outgoing_len()
    }

    /// Returns true if no outgoing entry was ever appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Incoming entries are already applied centrally, so they are recorded
/// as settled at `received_at` and never enter a pending queue.
pub(crate) fn incoming_records(
    state: &ChangeLogState,
    changes: &[RemoteChange],
    received_at: DateTime<Utc>,
) -> Vec<JournalRecord> {
    let mut seen = HashSet::new();
    changes
        .iter()
        .filter(|c| !state.contains(&c.entry.id) && seen.insert(c.entry.id))
        .map(|c| {
            let mut entry = c.entry.clone();
            entry.synced_at.get_or_insert(received_at);
            JournalRecord::ChangeIncoming {
                entry,
                server_version: c.server_version,
            }
        })
        .collect()
}
