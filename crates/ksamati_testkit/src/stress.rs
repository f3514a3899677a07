//! Stress tests for the sync store and coordinator.
//!
//! These tests verify behavior under heavy load and concurrent access.

use crate::integration::ServerRemote;
use ksamati_store::SyncStore;
use ksamati_sync_engine::{SyncConfig, SyncCoordinator};
use ksamati_sync_protocol::{DeviceId, NewChange};
use ksamati_sync_server::{ServerConfig, SyncServer};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads or devices.
    pub threads: usize,
    /// Number of distinct entities written.
    pub entity_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            entity_count: 1_000,
        }
    }
}

impl StressConfig {
    /// A small configuration suitable for unit tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            operations: 200,
            threads: 4,
            entity_count: 50,
        }
    }
}

fn expense(device: &DeviceId, i: usize, config: &StressConfig) -> NewChange {
    NewChange::create(
        device.clone(),
        "expense",
        format!("E-{}", i % config.entity_count.max(1)),
        json!({"index": i}),
    )
}

/// Run a sequential append stress test for one device.
pub fn stress_sequential_appends(store: &SyncStore, config: &StressConfig) -> StressTestResult {
    let device = DeviceId::new("stress-0");
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match store.change_log().append(expense(&device, i, config)) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run concurrent appends for one device from several threads.
///
/// Returns the result together with whether the assigned sequence numbers
/// were unique and contiguous from 1.
pub fn stress_concurrent_appends(
    store: Arc<SyncStore>,
    config: &StressConfig,
) -> (StressTestResult, bool) {
    let device = DeviceId::new("stress-shared");
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let threads = config.threads.max(1);
    let ops_per_thread = config.operations / threads;

    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let device = device.clone();
            let config = config.clone();

            thread::spawn(move || {
                let mut seqs = Vec::with_capacity(ops_per_thread);
                for i in 0..ops_per_thread {
                    match store
                        .change_log()
                        .append(expense(&device, t * ops_per_thread + i, &config))
                    {
                        Ok(entry) => {
                            seqs.push(entry.seq);
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                seqs
            })
        })
        .collect();

    let mut seqs = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(thread_seqs) => seqs.extend(thread_seqs),
            Err(_) => {
                failed.fetch_add(ops_per_thread, Ordering::Relaxed);
            }
        }
    }

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );

    let unique: HashSet<u64> = seqs.iter().copied().collect();
    let contiguous = unique.len() == seqs.len()
        && (1..=seqs.len() as u64).all(|seq| unique.contains(&seq))
        && store.change_log().pending_count(&device) == seqs.len() as u64;

    (result, contiguous)
}

/// Outcome of [`stress_sync_cycles`].
pub struct SyncStressResult {
    /// Entries that reached the server versus entries left behind.
    pub result: StressTestResult,
    /// Sync cycles that returned an error.
    pub cycle_errors: usize,
    /// The shared server, for inspecting the feed.
    pub server: Arc<SyncServer>,
}

/// Run sync cycles for several devices concurrently against one server.
///
/// Each device appends its share of the operations and then syncs until
/// drained. Every operation is one entry that must reach the server.
pub async fn stress_sync_cycles(config: &StressConfig) -> SyncStressResult {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let devices = config.threads.max(1);
    let ops_per_device = config.operations / devices;

    let mut tasks = Vec::with_capacity(devices);
    let start = Instant::now();

    for d in 0..devices {
        let server = Arc::clone(&server);
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            let device = DeviceId::new(format!("device-{}", d));
            let store = match SyncStore::in_memory() {
                Ok(store) => Arc::new(store),
                Err(_) => return (0, ops_per_device, 0),
            };
            let coordinator = SyncCoordinator::new(
                SyncConfig::default(),
                Arc::clone(&store),
                ServerRemote::new(server),
            );

            let mut failed = 0usize;
            for i in 0..ops_per_device {
                let change = NewChange::create(
                    device.clone(),
                    "expense",
                    format!("{}-E-{}", device, i % config.entity_count.max(1)),
                    json!({"index": i}),
                );
                if store.change_log().append(change).is_err() {
                    failed += 1;
                }
            }

            let mut rounds = 0;
            let mut cycle_errors = 0usize;
            while store.change_log().pending_count(&device) > 0 && rounds < 16 {
                if let Err(err) = coordinator.sync(&device).await {
                    tracing::warn!(
                        device = %device,
                        round = rounds,
                        error = %err,
                        "stress cycle failed"
                    );
                    cycle_errors += 1;
                }
                rounds += 1;
            }

            let left = store.change_log().pending_count(&device) as usize;
            let failed = failed + left;
            (ops_per_device.saturating_sub(failed), failed, cycle_errors)
        }));
    }

    let mut successful = 0usize;
    let mut failed = 0usize;
    let mut cycle_errors = 0usize;
    for task in tasks {
        match task.await {
            Ok((ok, err, cycles)) => {
                successful += ok;
                failed += err;
                cycle_errors += cycles;
            }
            Err(_) => failed += ops_per_device,
        }
    }

    SyncStressResult {
        result: StressTestResult::new(successful, failed, start.elapsed()),
        cycle_errors,
        server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_appends() {
        let store = SyncStore::in_memory().unwrap();
        let result = stress_sequential_appends(&store, &StressConfig::quick());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
        assert_eq!(store.change_log().len(), 200);
    }

    #[test]
    fn concurrent_appends_keep_sequence() {
        let store = Arc::new(SyncStore::in_memory().unwrap());
        let (result, contiguous) = stress_concurrent_appends(store, &StressConfig::quick());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
        assert!(contiguous);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sync_cycles_drain() {
        let config = StressConfig {
            operations: 120,
            threads: 3,
            entity_count: 1_000,
        };
        let run = stress_sync_cycles(&config).await;
        assert_eq!(run.cycle_errors, 0);
        assert_eq!(run.result.failed_ops, 0);
        assert_eq!(run.result.successful_ops, 120);
        assert_eq!(run.server.feed_len(), 120);
    }
}
