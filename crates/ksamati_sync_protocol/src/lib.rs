//! # KSAMATI Sync Protocol
//!
//! Data model and wire messages for KSAMATI offline synchronization.
//!
//! This crate provides:
//! - [`ChangeEntry`] and [`NewChange`] for local mutations awaiting upload
//! - [`DeviceCursor`] and [`DeviceStatus`] for per-device progress
//! - [`SyncConflict`] and [`Resolution`] for divergent versions
//! - Remote store messages (pull, push) and their CBOR codec
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod device;
mod entry;
mod error;
mod messages;

pub use codec::{decode_cbor, encode_cbor};
pub use conflict::{ConflictId, RemoteState, Resolution, SyncConflict};
pub use device::{DeviceCursor, DeviceId, DeviceStatus};
pub use entry::{ChangeEntry, EntityKey, EntityType, EntryId, NewChange, Operation, Payload};
pub use error::{ProtocolError, ProtocolResult, ValidationError};
pub use messages::{
    PullRequest, PullResponse, PushOutcome, PushRequest, PushResponse, PushResult, RemoteChange,
    SubmitMode, Submission, SyncMessage,
};

/// Wire protocol version carried by every encoded [`SyncMessage`].
pub const PROTOCOL_VERSION: u16 = 1;
