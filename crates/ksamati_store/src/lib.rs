//! # KSAMATI Store
//!
//! Durable local state for offline sync.
//!
//! This crate provides:
//! - [`ChangeLogStore`]: the outgoing `offline_queue` and incoming `data_sync`
//! - [`DeviceRegistry`]: per-device cursors and sync status
//! - [`ConflictStore`]: detected conflicts and their resolutions
//! - [`SyncStore`]: the three over one crash-safe journal, with atomic
//!   cycle commits
//!
//! ## Durability
//!
//! Every mutation is journaled before it becomes visible. A sync cycle is
//! committed as a single journal batch, so a crash leaves either the whole
//! cycle or none of it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod change_log;
mod config;
mod conflicts;
mod error;
mod file;
mod journal;
mod lock;
mod memory;
mod registry;
mod report;
mod store;

pub use backend::StorageBackend;
pub use change_log::{ChangeLogStore, DrainSnapshot};
pub use config::StoreConfig;
pub use conflicts::ConflictStore;
pub use error::{StoreError, StoreResult};
pub use file::FileBackend;
pub use journal::{compute_crc32, Journal, JournalRecord, Replay, Table, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use lock::{journal_path, StoreDir};
pub use memory::InMemoryBackend;
pub use registry::DeviceRegistry;
pub use report::{StoreReport, TableReport};
pub use store::{CycleCommit, Settlement, SyncStore};
