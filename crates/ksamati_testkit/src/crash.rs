//! Crash recovery testing for the sync store.
//!
//! This module simulates crashes part-way through journal writes and
//! verifies that the store recovers to a consistent state.
//!
//! ## Test Strategy
//!
//! 1. **Crash after append** - Committed entries survive
//! 2. **Crash during cycle commit** - Settlements and the cursor move together
//! 3. **Torn tail on disk** - A partial frame is dropped on reopen
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ksamati_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new()?;
//! harness.test_cycle_commit_is_atomic(3);
//! assert!(harness.all_passed());
//! ```

use ksamati_store::{
    journal_path, CycleCommit, InMemoryBackend, Settlement, StorageBackend, StoreConfig,
    StoreError, StoreResult, SyncStore,
};
use ksamati_sync_protocol::{ChangeEntry, DeviceId, NewChange};
use serde_json::json;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected pending entries after recovery.
    pub expected_pending: u64,
    /// Actual pending entries after recovery.
    pub actual_pending: u64,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, pending: u64) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_pending: pending,
            actual_pending: pending,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: u64, actual: u64, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_pending: expected,
            actual_pending: actual,
            error: Some(error.to_string()),
        }
    }
}

/// An in-memory backend that can simulate a crash mid-write.
///
/// Clones share the byte budget and crash flag, so a test can keep a
/// handle while the store owns another.
#[derive(Debug, Clone)]
pub struct CrashableBackend {
    inner: InMemoryBackend,
    budget: Arc<AtomicUsize>,
    crashed: Arc<AtomicBool>,
}

impl CrashableBackend {
    /// Creates an empty backend that never crashes until armed.
    pub fn new() -> Self {
        Self {
            inner: InMemoryBackend::new(),
            budget: Arc::new(AtomicUsize::new(usize::MAX)),
            crashed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Crashes once `bytes` more bytes have been written.
    ///
    /// The write that crosses the budget is cut short at the budget.
    pub fn crash_after(&self, bytes: usize) {
        self.budget.store(bytes, Ordering::SeqCst);
    }

    /// Removes the budget and clears the crash flag.
    pub fn disarm(&self) {
        self.budget.store(usize::MAX, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Returns a copy of the bytes written so far.
    pub fn data(&self) -> Vec<u8> {
        self.inner.data()
    }

    /// Returns a fresh backend holding what reached storage before the crash.
    pub fn survivor(&self) -> InMemoryBackend {
        InMemoryBackend::with_data(self.inner.data())
    }

    fn crash(&self, message: &str) -> StoreError {
        self.crashed.store(true, Ordering::SeqCst);
        StoreError::Io(io::Error::new(io::ErrorKind::Other, message.to_string()))
    }
}

impl Default for CrashableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StoreResult<u64> {
        if self.has_crashed() {
            return Err(self.crash("write after simulated crash"));
        }

        let budget = self.budget.load(Ordering::SeqCst);
        if budget == usize::MAX {
            return self.inner.append(bytes);
        }
        if bytes.len() > budget {
            if budget > 0 {
                let _ = self.inner.append(&bytes[..budget]);
            }
            self.budget.store(0, Ordering::SeqCst);
            return Err(self.crash("simulated crash during partial write"));
        }

        self.budget.store(budget - bytes.len(), Ordering::SeqCst);
        self.inner.append(bytes)
    }

    fn sync(&mut self) -> StoreResult<()> {
        if self.has_crashed() {
            return Err(self.crash("simulated crash during sync"));
        }
        self.inner.sync()
    }

    fn size(&self) -> StoreResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
        if self.has_crashed() {
            return Err(self.crash("truncate after simulated crash"));
        }
        self.inner.truncate(new_size)
    }
}

fn append_pending(
    store: &SyncStore,
    device: &DeviceId,
    count: usize,
) -> StoreResult<Vec<ChangeEntry>> {
    (0..count)
        .map(|i| {
            store.change_log().append(NewChange::create(
                device.clone(),
                "expense",
                format!("E-{}", i),
                json!({"amount": i}),
            ))
        })
        .collect()
}

/// Test harness for crash recovery scenarios.
pub struct CrashRecoveryHarness {
    dir: TempDir,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a new harness with a temporary directory.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
            results: Vec::new(),
        })
    }

    /// Returns true if every recorded test passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    fn record(
        &mut self,
        description: &str,
        result: StoreResult<CrashRecoveryResult>,
    ) -> CrashRecoveryResult {
        let result = result
            .unwrap_or_else(|e| CrashRecoveryResult::fail(description, 0, 0, &e.to_string()));
        self.results.push(result.clone());
        result
    }

    /// Tests that appended entries survive a crash on the next write.
    pub fn test_committed_appends_survive(&mut self, count: usize) -> CrashRecoveryResult {
        let description = "Committed appends survive crash";
        let result = (|| -> StoreResult<CrashRecoveryResult> {
            let device = DeviceId::new("tablet");
            let backend = CrashableBackend::new();
            let store =
                SyncStore::with_backend(Box::new(backend.clone()), &StoreConfig::default())?;
            append_pending(&store, &device, count)?;

            backend.crash_after(0);
            if append_pending(&store, &device, 1).is_ok() {
                return Ok(CrashRecoveryResult::fail(
                    description,
                    count as u64,
                    count as u64 + 1,
                    "write after crash succeeded",
                ));
            }
            drop(store);

            let recovered =
                SyncStore::with_backend(Box::new(backend.survivor()), &StoreConfig::default())?;
            let pending = recovered.change_log().pending_count(&device);
            if pending == count as u64 {
                Ok(CrashRecoveryResult::pass(description, pending))
            } else {
                Ok(CrashRecoveryResult::fail(
                    description,
                    count as u64,
                    pending,
                    "entries were lost",
                ))
            }
        })();
        self.record(description, result)
    }

    /// Crashes a cycle commit at every byte offset and checks that each
    /// recovered store shows either the whole cycle or none of it.
    pub fn test_cycle_commit_is_atomic(&mut self, entries: usize) -> CrashRecoveryResult {
        let description = "Cycle commit is atomic at every crash point";
        let result = (|| -> StoreResult<CrashRecoveryResult> {
            let device = DeviceId::new("tablet");
            let expected = entries as u64;
            let mut budget = 0usize;

            loop {
                let backend = CrashableBackend::new();
                let store =
                    SyncStore::with_backend(Box::new(backend.clone()), &StoreConfig::default())?;
                let pending = append_pending(&store, &device, entries)?;

                let mut commit = CycleCommit::new(device.clone(), expected, 0);
                commit.settled = pending
                    .iter()
                    .map(|entry| Settlement::applied(entry.id, 1))
                    .collect();

                backend.crash_after(budget);
                let committed = store.commit_cycle(commit).is_ok();
                drop(store);

                let recovered =
                    SyncStore::with_backend(Box::new(backend.survivor()), &StoreConfig::default())?;
                let cursor = recovered.registry().get_cursor(&device);
                let left = recovered.change_log().pending_count(&device);

                let consistent = match (cursor, left) {
                    (0, left) => !committed && left == expected,
                    (cursor, 0) => cursor == expected,
                    _ => false,
                };
                if !consistent {
                    return Ok(CrashRecoveryResult::fail(
                        description,
                        if committed { 0 } else { expected },
                        left,
                        &format!("crash after {} bytes left cursor {}", budget, cursor),
                    ));
                }
                if committed {
                    return Ok(CrashRecoveryResult::pass(description, 0));
                }
                budget += 1;
            }
        })();
        self.record(description, result)
    }

    /// Tests that a partial frame at the end of the journal file is
    /// truncated when the store is reopened for writing.
    pub fn test_torn_tail_truncated(&mut self) -> CrashRecoveryResult {
        let description = "Torn journal tail is truncated";
        let result = (|| -> StoreResult<CrashRecoveryResult> {
            let path = self.dir.path().join("torn_tail");
            let device = DeviceId::new("tablet");

            let store = SyncStore::open(&path, StoreConfig::default())?;
            append_pending(&store, &device, 2)?;
            drop(store);

            let journal = journal_path(&path);
            let clean_len = std::fs::metadata(&journal)?.len();
            let mut file = std::fs::OpenOptions::new().append(true).open(&journal)?;
            file.write_all(b"KSJR\x01")?;
            drop(file);

            let store = SyncStore::open(&path, StoreConfig::default())?;
            let report = store.report()?;
            let pending = store.change_log().pending_count(&device);
            drop(store);
            let len = std::fs::metadata(&journal)?.len();

            if pending != 2 {
                Ok(CrashRecoveryResult::fail(description, 2, pending, "entries were lost"))
            } else if report.torn_bytes != 5 || len != clean_len {
                Ok(CrashRecoveryResult::fail(
                    description,
                    2,
                    pending,
                    &format!("journal is {} bytes, expected {}", len, clean_len),
                ))
            } else {
                Ok(CrashRecoveryResult::pass(description, pending))
            }
        })();
        self.record(description, result)
    }

    /// Runs every scenario.
    pub fn run_all(&mut self) -> &[CrashRecoveryResult] {
        self.test_committed_appends_survive(5);
        self.test_cycle_commit_is_atomic(3);
        self.test_torn_tail_truncated();
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crashable_backend_cuts_write_short() {
        let mut backend = CrashableBackend::new();
        backend.append(b"offline").unwrap();
        backend.crash_after(3);

        assert!(backend.append(b"queue").is_err());
        assert!(backend.has_crashed());
        assert_eq!(backend.data(), b"offlineque");
        assert!(backend.sync().is_err());
        assert!(backend.truncate(7).is_err());

        backend.disarm();
        backend.append(b"!").unwrap();
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn committed_appends_survive() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        let result = harness.test_committed_appends_survive(4);
        assert!(result.passed, "{:?}", result.error);
    }

    #[test]
    fn cycle_commit_is_atomic() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        let result = harness.test_cycle_commit_is_atomic(3);
        assert!(result.passed, "{:?}", result.error);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        let result = harness.test_torn_tail_truncated();
        assert!(result.passed, "{:?}", result.error);
    }

    #[test]
    fn run_all_passes() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        assert_eq!(harness.run_all().len(), 3);
        assert!(harness.all_passed());
    }
}
