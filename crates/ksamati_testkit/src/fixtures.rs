//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores
//! and common sync scenarios.

use ksamati_store::{InMemoryBackend, StoreConfig, SyncStore};
use ksamati_sync_protocol::{ChangeEntry, DeviceId, NewChange};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

enum Source {
    Memory(InMemoryBackend),
    Dir(TempDir),
}

/// A test store with automatic cleanup.
///
/// Both kinds can be reopened over the same journal to exercise recovery.
pub struct TestStore {
    /// The store instance.
    pub store: SyncStore,
    source: Source,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        let backend = InMemoryBackend::new();
        let store = SyncStore::with_backend(Box::new(backend.clone()), &StoreConfig::default())
            .expect("Failed to open in-memory store");
        Self {
            store,
            source: Source::Memory(backend),
        }
    }

    /// Creates a new store in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = SyncStore::open(temp_dir.path(), StoreConfig::default().sync_on_write(false))
            .expect("Failed to open file store");
        Self {
            store,
            source: Source::Dir(temp_dir),
        }
    }

    /// Returns the store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Dir(dir) => Some(dir.path()),
            Source::Memory(_) => None,
        }
    }

    /// Closes the store and opens it again from its journal.
    pub fn reopen(self) -> Self {
        let Self { store, source } = self;
        drop(store);
        let store = match &source {
            Source::Memory(backend) => {
                SyncStore::with_backend(Box::new(backend.clone()), &StoreConfig::default())
            }
            Source::Dir(dir) => {
                SyncStore::open(dir.path(), StoreConfig::default().sync_on_write(false))
            }
        }
        .expect("Failed to reopen store");
        Self { store, source }
    }
}

impl std::ops::Deref for TestStore {
    type Target = SyncStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary in-memory store.
///
/// # Example
///
/// ```rust,ignore
/// use ksamati_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|store| {
///         assert_eq!(store.change_log().len(), 0);
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&SyncStore) -> R,
{
    let test_store = TestStore::memory();
    f(&test_store.store)
}

/// Runs a test with a store in a temporary directory.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&SyncStore, &Path) -> R,
{
    let test_store = TestStore::file();
    let path = test_store.path().expect("File store should have a path");
    f(&test_store.store, path)
}

/// An update to a contract, based on `local_version`.
pub fn contract_update(device: &DeviceId, contract: &str, local_version: u64) -> NewChange {
    NewChange::update(
        device.clone(),
        "contract",
        contract,
        local_version,
        json!({"contract": contract, "amount": local_version * 100}),
    )
}

/// Appends `count` expense creations for a device.
pub fn append_changes(store: &SyncStore, device: &DeviceId, count: usize) -> Vec<ChangeEntry> {
    (0..count)
        .map(|i| {
            store
                .change_log()
                .append(NewChange::create(
                    device.clone(),
                    "expense",
                    format!("{}-E-{}", device, i),
                    json!({"index": i, "amount": 10 * i}),
                ))
                .expect("Failed to append change")
        })
        .collect()
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a store with pending entries for several devices.
    pub fn populated_store(devices: usize, entries_per_device: usize) -> (TestStore, Vec<DeviceId>) {
        let test_store = TestStore::memory();
        let ids: Vec<DeviceId> = (0..devices)
            .map(|i| DeviceId::new(format!("device-{}", i)))
            .collect();
        for device in &ids {
            append_changes(&test_store, device, entries_per_device);
        }
        (test_store, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let test_store = TestStore::memory();
        assert!(test_store.path().is_none());
        assert!(test_store.report().unwrap().is_healthy());
    }

    #[test]
    fn test_with_temp_store() {
        with_temp_store(|store| {
            let entries = append_changes(store, &DeviceId::new("tablet"), 3);
            assert_eq!(entries.last().map(|e| e.seq), Some(3));
        });
    }

    #[test]
    fn test_reopen_keeps_entries() {
        for test_store in [TestStore::memory(), TestStore::file()] {
            let device = DeviceId::new("tablet");
            append_changes(&test_store, &device, 2);

            let reopened = test_store.reopen();
            assert_eq!(reopened.change_log().pending_count(&device), 2);
        }
    }

    #[test]
    fn test_populated_scenario() {
        let (store, devices) = scenarios::populated_store(3, 4);
        assert_eq!(devices.len(), 3);
        assert_eq!(store.device_statuses().len(), 3);
        assert_eq!(store.change_log().len(), 12);
    }
}
