//! The sync store: journal, tables and atomic cycle commits.

use crate::backend::StorageBackend;
use crate::change_log::{incoming_records, ChangeLogState, ChangeLogStore};
use crate::config::StoreConfig;
use crate::conflicts::{ConflictState, ConflictStore};
use crate::error::{StoreError, StoreResult};
use crate::file::FileBackend;
use crate::journal::{Journal, JournalRecord, Replay, Table};
use crate::lock::{journal_path, StoreDir};
use crate::memory::InMemoryBackend;
use crate::registry::{DeviceRegistry, RegistryState};
use crate::report::{StoreReport, TableReport};
use chrono::{DateTime, Utc};
use ksamati_sync_protocol::{
    ConflictId, DeviceId, DeviceStatus, EntryId, Payload, RemoteChange, Resolution, SyncConflict,
};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A queued entry settled during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// The settled entry.
    pub entry_id: EntryId,
    /// Entity version produced, if the entry was applied.
    pub server_version: Option<u64>,
}

impl Settlement {
    /// An entry the central store applied.
    pub fn applied(entry_id: EntryId, server_version: u64) -> Self {
        Self {
            entry_id,
            server_version: Some(server_version),
        }
    }

    /// An entry closed without being applied.
    pub fn discarded(entry_id: EntryId) -> Self {
        Self {
            entry_id,
            server_version: None,
        }
    }
}

/// Everything a successful sync cycle changes, committed as one unit.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    /// Device the cycle ran for.
    pub device_id: DeviceId,
    /// New local cursor.
    pub cursor: u64,
    /// New central feed position.
    pub remote_cursor: u64,
    /// Entries settled by the cycle.
    pub settled: Vec<Settlement>,
    /// Changes pulled from the central store.
    pub incoming: Vec<RemoteChange>,
    /// Conflicts opened, decided or closed by the cycle.
    pub conflicts: Vec<SyncConflict>,
    /// When the cycle completed.
    pub completed_at: DateTime<Utc>,
}

impl CycleCommit {
    /// Creates an empty commit for a device.
    pub fn new(device_id: DeviceId, cursor: u64, remote_cursor: u64) -> Self {
        Self {
            device_id,
            cursor,
            remote_cursor,
            settled: Vec::new(),
            incoming: Vec::new(),
            conflicts: Vec::new(),
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Recovery {
    frames: u64,
    torn_bytes: u64,
    discarded_batches: u64,
}

/// Local sync state: the `data_sync`, `offline_queue`, `sync_conflicts` and
/// `device_sync_status` tables over one journal.
///
/// A file-backed store holds an exclusive lock on its directory. Read-only
/// handles take no lock and never modify the journal.
///
/// # Example
///
/// ```rust,ignore
/// use ksamati_store::{StoreConfig, SyncStore};
///
/// let store = SyncStore::open(Path::new("sync_data"), StoreConfig::default())?;
/// let entry = store.change_log().append(change)?;
/// ```
#[derive(Debug)]
pub struct SyncStore {
    path: Option<PathBuf>,
    _dir: Option<StoreDir>,
    journal: Arc<Journal>,
    change_log: ChangeLogStore,
    registry: DeviceRegistry,
    conflicts: ConflictStore,
    schema: RwLock<BTreeSet<Table>>,
    recovery: Recovery,
}

impl SyncStore {
    /// Opens or creates a store directory for writing.
    pub fn open(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        Self::build(
            Box::new(backend),
            config.sync_on_write,
            false,
            Some(path.to_path_buf()),
            Some(dir),
        )
    }

    /// Opens an existing store for inspection.
    ///
    /// Nothing is created, truncated or locked; a torn tail is only
    /// reported.
    pub fn open_read_only(path: &Path) -> StoreResult<Self> {
        if !path.is_dir() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        let backend = FileBackend::open_read_only(&journal_path(path))?;
        Self::build(
            Box::new(backend),
            false,
            true,
            Some(path.to_path_buf()),
            None,
        )
    }

    /// Creates an ephemeral in-memory store.
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_backend(Box::new(InMemoryBackend::new()), &StoreConfig::default())
    }

    /// Opens a store over an arbitrary backend.
    pub fn with_backend(
        backend: Box<dyn StorageBackend>,
        config: &StoreConfig,
    ) -> StoreResult<Self> {
        Self::build(backend, config.sync_on_write, false, None, None)
    }

    fn build(
        backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
        read_only: bool,
        path: Option<PathBuf>,
        dir: Option<StoreDir>,
    ) -> StoreResult<Self> {
        let journal = Arc::new(Journal::new(backend, sync_on_write, read_only));
        let replay = journal.replay()?;

        if replay.torn_bytes > 0 {
            if read_only {
                tracing::warn!(
                    torn_bytes = replay.torn_bytes,
                    "journal has a torn tail; leaving it in place"
                );
            } else {
                tracing::warn!(
                    torn_bytes = replay.torn_bytes,
                    discarded_batches = replay.discarded_batches,
                    "truncating torn journal tail"
                );
                journal.truncate_tail(replay.valid_len)?;
            }
        }

        let store = Self {
            path,
            _dir: dir,
            change_log: ChangeLogStore::new(Arc::clone(&journal)),
            registry: DeviceRegistry::new(Arc::clone(&journal)),
            conflicts: ConflictStore::new(Arc::clone(&journal)),
            journal,
            schema: RwLock::new(BTreeSet::new()),
            recovery: Recovery {
                frames: replay.frames,
                torn_bytes: replay.torn_bytes,
                discarded_batches: replay.discarded_batches,
            },
        };
        store.load(&replay);
        if !read_only {
            store.provision()?;
        }

        tracing::info!(
            path = ?store.path,
            records = replay.records.len(),
            read_only,
            "sync store opened"
        );
        Ok(store)
    }

    fn load(&self, replay: &Replay) {
        let mut tables = self.lock_tables();
        for record in &replay.records {
            tables.apply(record);
        }
    }

    /// Creates any of the four tables that were never provisioned.
    fn provision(&self) -> StoreResult<()> {
        let mut tables = self.lock_tables();
        let missing: Vec<JournalRecord> = Table::SYNC_TABLES
            .iter()
            .filter(|t| !tables.schema.contains(*t))
            .map(|t| JournalRecord::TableCreated(*t))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.journal.append_batch(&missing)?;
        for record in &missing {
            tables.apply(record);
        }
        tracing::debug!(tables = missing.len(), "sync tables provisioned");
        Ok(())
    }

    fn lock_tables(&self) -> Tables<'_> {
        Tables {
            log: self.change_log.state.write(),
            registry: self.registry.state.write(),
            conflicts: self.conflicts.state.write(),
            schema: self.schema.write(),
        }
    }

    /// Returns the change log.
    pub fn change_log(&self) -> &ChangeLogStore {
        &self.change_log
    }

    /// Returns the device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Returns the conflict table.
    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    /// Returns the store directory, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true if the store was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.journal.is_read_only()
    }

    /// Commits the outcome of a sync cycle atomically.
    ///
    /// Settlements, incoming changes, conflict records, both cursors and the
    /// device status are written as one journal batch. After a crash either
    /// all of them are visible or none are.
    ///
    /// # Errors
    ///
    /// - [`StoreError::OutOfOrder`] if either cursor would move backwards
    /// - [`StoreError::UnknownEntry`] if a settlement names no entry
    pub fn commit_cycle(&self, commit: CycleCommit) -> StoreResult<DeviceStatus> {
        let mut tables = self.lock_tables();
        let device_id = &commit.device_id;
        let current = tables.registry.cursor(device_id);

        for (current, attempted) in [
            (current.cursor, commit.cursor),
            (current.remote_cursor, commit.remote_cursor),
        ] {
            if attempted < current {
                tracing::error!(
                    device = %device_id,
                    current,
                    attempted,
                    "sync cycle would regress cursor"
                );
                return Err(StoreError::OutOfOrder {
                    device_id: device_id.clone(),
                    current,
                    attempted,
                });
            }
        }

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut settled_here = 0u64;
        for settlement in &commit.settled {
            let entry = tables
                .log
                .get(&settlement.entry_id)
                .ok_or(StoreError::UnknownEntry(settlement.entry_id))?;
            if !entry.is_pending() || !seen.insert(settlement.entry_id) {
                continue;
            }
            if &entry.device_id == device_id {
                settled_here += 1;
            }
            records.push(JournalRecord::ChangeSettled {
                entry_id: settlement.entry_id,
                synced_at: commit.completed_at,
                server_version: settlement.server_version,
            });
        }
        records.extend(incoming_records(
            &tables.log,
            &commit.incoming,
            commit.completed_at,
        ));
        records.extend(
            commit
                .conflicts
                .iter()
                .cloned()
                .map(JournalRecord::ConflictUpserted),
        );
        records.push(JournalRecord::CursorAdvanced {
            device_id: device_id.clone(),
            cursor: commit.cursor,
            remote_cursor: commit.remote_cursor,
        });

        let pending = tables
            .log
            .pending_count(device_id)
            .saturating_sub(settled_here);
        let mut status = tables.registry.status(device_id);
        status.record_success(commit.cursor, pending, commit.completed_at);
        records.push(JournalRecord::StatusUpdated(status.clone()));

        self.journal.append_batch(&records)?;
        for record in &records {
            tables.apply(record);
        }

        tracing::debug!(
            device = %device_id,
            cursor = commit.cursor,
            remote_cursor = commit.remote_cursor,
            settled = seen.len(),
            incoming = commit.incoming.len(),
            conflicts = commit.conflicts.len(),
            pending,
            "sync cycle committed"
        );
        Ok(status)
    }

    /// Records a decision on an open conflict.
    ///
    /// `RemoteWins` takes effect immediately: the conflict closes and the
    /// local entry is settled without being applied. `LocalWins` and
    /// `Merged` are recorded and delivered by the next cycle.
    pub fn decide_conflict(
        &self,
        conflict_id: &ConflictId,
        resolution: Resolution,
        merged_payload: Option<Payload>,
    ) -> StoreResult<SyncConflict> {
        let mut tables = self.lock_tables();
        let mut conflict = tables
            .conflicts
            .get(conflict_id)
            .cloned()
            .ok_or(StoreError::UnknownConflict(*conflict_id))?;
        if !conflict.is_open() {
            return Err(StoreError::ConflictClosed(*conflict_id));
        }
        let merged_payload = match (resolution, merged_payload) {
            (Resolution::Pending, _) => {
                return Err(StoreError::InvalidDecision(
                    "a decision cannot be pending".into(),
                ))
            }
            (Resolution::Merged, None) => {
                return Err(StoreError::InvalidDecision(
                    "merged resolution requires a payload".into(),
                ))
            }
            (Resolution::Merged, payload) => payload,
            _ => None,
        };

        conflict.decide(resolution, merged_payload);
        let mut records = Vec::new();
        if resolution == Resolution::RemoteWins {
            let now = Utc::now();
            conflict.close(now);
            if tables
                .log
                .get(&conflict.entry_id)
                .is_some_and(|e| e.is_pending())
            {
                records.push(JournalRecord::ChangeSettled {
                    entry_id: conflict.entry_id,
                    synced_at: now,
                    server_version: Some(conflict.remote_version),
                });
            }
        }
        records.push(JournalRecord::ConflictUpserted(conflict.clone()));

        if records.len() == 1 {
            self.journal.append(&records[0])?;
        } else {
            self.journal.append_batch(&records)?;
        }
        for record in &records {
            tables.apply(record);
        }

        tracing::info!(
            conflict = %conflict.id,
            entity = %conflict.key(),
            resolution = %resolution,
            "conflict decided"
        );
        Ok(conflict)
    }

    /// Returns every known device with a live pending count.
    pub fn device_statuses(&self) -> Vec<DeviceStatus> {
        let log = self.change_log.state.read();
        let registry = self.registry.state.read();
        let mut devices: BTreeMap<DeviceId, DeviceStatus> = BTreeMap::new();
        for device in registry.devices().iter().chain(log.devices()) {
            if devices.contains_key(device) {
                continue;
            }
            let mut status = registry.status(device);
            status.pending_count = log.pending_count(device);
            devices.insert(device.clone(), status);
        }
        devices.into_values().collect()
    }

    /// Reports table existence, row counts and journal health.
    pub fn report(&self) -> StoreResult<StoreReport> {
        let log = self.change_log.state.read();
        let registry = self.registry.state.read();
        let conflicts = self.conflicts.state.read();
        let schema = self.schema.read();

        let tables = Table::SYNC_TABLES
            .iter()
            .map(|table| TableReport {
                name: table.name(),
                exists: schema.contains(table),
                rows: match table {
                    Table::DataSync => log.incoming_len(),
                    Table::OfflineQueue => log.outgoing_len(),
                    Table::SyncConflicts => conflicts.len(),
                    Table::DeviceSyncStatus => registry.rows(),
                    Table::Control => 0,
                },
            })
            .collect();

        Ok(StoreReport {
            path: self.path.clone(),
            journal_bytes: self.journal.size()?,
            frames: self.recovery.frames,
            torn_bytes: self.recovery.torn_bytes,
            discarded_batches: self.recovery.discarded_batches,
            tables,
            pending_entries: log.pending_len(),
            open_conflicts: conflicts.open_len(),
        })
    }
}

/// Write guards over all table state, taken in a fixed order: change log,
/// registry, conflicts, schema.
struct Tables<'a> {
    log: RwLockWriteGuard<'a, ChangeLogState>,
    registry: RwLockWriteGuard<'a, RegistryState>,
    conflicts: RwLockWriteGuard<'a, ConflictState>,
    schema: RwLockWriteGuard<'a, BTreeSet<Table>>,
}

impl Tables<'_> {
    fn apply(&mut self, record: &JournalRecord) {
        match record.table() {
            Table::OfflineQueue | Table::DataSync => self.log.apply(record),
            Table::SyncConflicts => self.conflicts.apply(record),
            Table::DeviceSyncStatus => self.registry.apply(record),
            Table::Control => {
                if let JournalRecord::TableCreated(table) = record {
                    self.schema.insert(*table);
                }
            }
        }
    }
}
