//! # KSAMATI Sync Engine
//!
//! Conflict detection and sync coordination for KSAMATI devices.
//!
//! This crate provides:
//! - The sync coordinator (idle → pulling → pushing → reconciling)
//! - Per-device cycle leases
//! - Version-based conflict detection
//! - Pluggable resolution policies (last-writer-wins, local, remote,
//!   manual, merge)
//! - Retry with exponential backoff
//! - A CBOR transport over any request client
//!
//! ## Architecture
//!
//! A cycle pulls the central feed first, then pushes the device's pending
//! change log entries. Conflicts reported by the central store go through
//! the [`ConflictDetector`] and the configured [`ResolutionPolicy`]. The
//! cycle ends with a single atomic commit to the local
//! [`SyncStore`](ksamati_store::SyncStore).
//!
//! ## Key Invariants
//!
//! - A failed cycle commits nothing; the cursor never moves past an
//!   entry that was not settled
//! - Cursors never move backwards
//! - At most one cycle runs per device
//! - The central store applies each entry id at most once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod config;
mod coordinator;
mod detector;
mod error;
mod lease;
mod policy;
mod state;
mod transport;

pub use cbor::{CborTransport, LoopbackClient, LoopbackServer, RequestClient};
pub use config::{RetryConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use detector::{ConflictCheck, ConflictDetector};
pub use error::{SyncError, SyncResult};
pub use lease::{CycleLease, DeviceLeases};
pub use policy::{
    json_field_merge, Decision, LastWriterWins, LocalWins, Manual, MergeFn, MergePolicy,
    RemoteWins, ResolutionPolicy,
};
pub use state::{SyncCycleResult, SyncState, SyncStats};
pub use transport::{MockRemote, RemoteStore};
