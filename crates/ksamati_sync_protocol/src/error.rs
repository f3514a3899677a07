//! Error types for the sync protocol.

use crate::entry::Operation;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {0}")]
    Decode(String),

    /// The message carried a protocol version this build does not speak.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },

    /// A change entry failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A malformed change entry. Rejected at append time, never enters the log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field was empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The entity type is not a valid identifier.
    #[error("invalid entity type {0:?}: expected [A-Za-z][A-Za-z0-9_]{{0,63}}")]
    InvalidEntityType(String),

    /// Create and update operations must carry a payload.
    #[error("{0} operation requires a payload")]
    PayloadRequired(Operation),

    /// Delete operations must not carry a payload.
    #[error("delete operation must not carry a payload")]
    PayloadNotAllowed,
}
