//! Error types for the sync engine.

use ksamati_store::StoreError;
use ksamati_sync_protocol::{ConflictId, DeviceId, EntityKey, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The central store reported an error.
    #[error("server error: {0}")]
    ServerError(String),

    /// The central store refused the request and it must not be retried.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A remote call did not finish within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// A cursor would have moved backwards.
    #[error("cursor for device {device_id} would move from {current} to {attempted}")]
    OutOfOrder {
        /// Device whose cursor was advanced.
        device_id: DeviceId,
        /// Current cursor.
        current: u64,
        /// Rejected cursor.
        attempted: u64,
    },

    /// A conflict needs a decision before its entry can be delivered.
    #[error("conflict {conflict_id} on {entity} awaits a decision")]
    ConflictUnresolved {
        /// Conflict id.
        conflict_id: ConflictId,
        /// Conflicted entity.
        entity: EntityKey,
    },

    /// The cycle was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Another cycle is already running for the device.
    #[error("a sync cycle is already running for device {0}")]
    CycleInProgress(DeviceId),

    /// Local store error.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfOrder {
                device_id,
                current,
                attempted,
            } => SyncError::OutOfOrder {
                device_id,
                current,
                attempted,
            },
            other => SyncError::Store(other),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
