//! Error types for the sync server.

use ksamati_sync_protocol::{ProtocolError, SyncMessage};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Push batch over the configured limit.
    #[error("too many submissions: {size} > {max}")]
    BatchTooLarge {
        /// Submissions in the request.
        size: usize,
        /// Configured maximum.
        max: u32,
    },

    /// Message could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A response message was sent to the server.
    #[error("unexpected message type {0}")]
    UnexpectedMessage(u8),
}

impl ServerError {
    /// Returns true if the client may retry the same request.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Converts the error to a wire message.
    pub fn to_message(&self) -> SyncMessage {
        SyncMessage::Error {
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}
