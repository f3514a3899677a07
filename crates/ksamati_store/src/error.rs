//! Error types for the sync store.

use ksamati_sync_protocol::{ConflictId, DeviceId, EntryId, ProtocolError, ValidationError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the sync store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a backend.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Backend size.
        size: u64,
    },

    /// The journal holds an invalid record before its tail.
    #[error("journal corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the offending record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// A change entry was rejected at append time.
    #[error("invalid change entry: {0}")]
    Validation(#[from] ValidationError),

    /// A cursor regression was attempted.
    #[error("cursor for device {device_id} cannot move from {current} back to {attempted}")]
    OutOfOrder {
        /// Device whose cursor was targeted.
        device_id: DeviceId,
        /// Current cursor.
        current: u64,
        /// Rejected value.
        attempted: u64,
    },

    /// No entry with this id exists.
    #[error("unknown change entry {0}")]
    UnknownEntry(EntryId),

    /// No conflict with this id exists.
    #[error("unknown conflict {0}")]
    UnknownConflict(ConflictId),

    /// The conflict has already been resolved.
    #[error("conflict {0} is already resolved")]
    ConflictClosed(ConflictId),

    /// A resolution decision is not acceptable.
    #[error("invalid resolution: {0}")]
    InvalidDecision(String),

    /// Another process holds the store directory.
    #[error("store directory is locked by another process: {0}")]
    Locked(PathBuf),

    /// The store directory does not exist.
    #[error("no sync store at {0}")]
    NotFound(PathBuf),

    /// A write was attempted through a read-only handle.
    #[error("store is open read-only")]
    ReadOnly,

    /// A failed write could not be rolled back; reopen to recover.
    #[error("journal has an unrecovered partial write at offset {0}")]
    Poisoned(u64),
}

impl StoreError {
    pub(crate) fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_display() {
        let err = StoreError::OutOfOrder {
            device_id: DeviceId::new("tablet-7"),
            current: 10,
            attempted: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("tablet-7"));
        assert!(msg.contains("10"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn validation_wraps() {
        let err: StoreError = ValidationError::MissingField("entity_id").into();
        assert!(matches!(err, StoreError::Validation(_)));
    }
}
