//! Remote store protocol messages.
//!
//! The central store speaks two requests: `pull(since)` returns changes
//! made by other devices after a feed position, and `push(entries)` returns
//! one result per entry, either `Applied` or `Conflict(remote state)`.
//! Push must be idempotent per entry id so retries are harmless.

use crate::codec::{decode_cbor, encode_cbor};
use crate::conflict::RemoteState;
use crate::device::DeviceId;
use crate::entry::{ChangeEntry, EntryId, Payload};
use crate::error::{ProtocolError, ProtocolResult};
use crate::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};

/// Request for changes after a feed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Requesting device; its own changes are not returned.
    pub device_id: DeviceId,
    /// Feed position already pulled.
    pub since: u64,
    /// Maximum number of changes to return.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new(device_id: DeviceId, since: u64, limit: u32) -> Self {
        Self {
            device_id,
            since,
            limit,
        }
    }
}

/// A change as recorded in the central feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Position in the central feed.
    pub feed_seq: u64,
    /// Entity version produced by this change.
    pub server_version: u64,
    /// The change as applied (payload reflects forced or merged content).
    pub entry: ChangeEntry,
}

/// Changes after the requested position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes in feed order.
    pub changes: Vec<RemoteChange>,
    /// Feed position to pull from next time.
    pub cursor: u64,
    /// Whether more changes are waiting.
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a pull response.
    pub fn new(changes: Vec<RemoteChange>, cursor: u64, has_more: bool) -> Self {
        Self {
            changes,
            cursor,
            has_more,
        }
    }
}

/// How the central store treats a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// Apply only if `local_version` matches the server version.
    Normal,
    /// Overwrite the server version regardless.
    Force,
}

/// One entry submitted for apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// The entry.
    pub entry: ChangeEntry,
    /// Apply mode.
    pub mode: SubmitMode,
    /// Document to apply instead of the entry's payload (merged content).
    pub replacement: Option<Payload>,
}

impl Submission {
    /// Version-checked submission.
    pub fn normal(entry: ChangeEntry) -> Self {
        Self {
            entry,
            mode: SubmitMode::Normal,
            replacement: None,
        }
    }

    /// Force-overwrite submission (local wins).
    pub fn force(entry: ChangeEntry) -> Self {
        Self {
            entry,
            mode: SubmitMode::Force,
            replacement: None,
        }
    }

    /// Force-overwrite submission carrying a merged document.
    pub fn merged(entry: ChangeEntry, payload: Payload) -> Self {
        Self {
            entry,
            mode: SubmitMode::Force,
            replacement: Some(payload),
        }
    }

    /// Returns the document that will be applied.
    pub fn effective_payload(&self) -> Option<&Payload> {
        self.replacement.as_ref().or(self.entry.payload.as_ref())
    }
}

/// Batch of submissions from one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Submitting device.
    pub device_id: DeviceId,
    /// Submissions in log order.
    pub submissions: Vec<Submission>,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(device_id: DeviceId, submissions: Vec<Submission>) -> Self {
        Self {
            device_id,
            submissions,
        }
    }
}

/// Result of applying one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushResult {
    /// Applied (or already applied earlier); the entity now has this version.
    Applied {
        /// Entity version produced by the entry.
        server_version: u64,
    },
    /// Not applied: the entry was based on a different version.
    Conflict(RemoteState),
}

/// Per-entry push outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushOutcome {
    /// Entry the outcome belongs to.
    pub entry_id: EntryId,
    /// Result.
    pub result: PushResult,
}

/// Outcomes for a push request, in submission order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushResponse {
    /// One outcome per submission.
    pub outcomes: Vec<PushOutcome>,
}

impl PushResponse {
    /// Creates a push response.
    pub fn new(outcomes: Vec<PushOutcome>) -> Self {
        Self { outcomes }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Push request.
    PushRequest(PushRequest),
    /// Push response.
    PushResponse(PushResponse),
    /// Request could not be served.
    Error {
        /// Error message.
        message: String,
        /// Whether the client may retry.
        retryable: bool,
    },
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u16,
    message: &'a SyncMessage,
}

#[derive(Deserialize)]
struct Envelope {
    version: u16,
    message: SyncMessage,
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::PullRequest(_) => 1,
            SyncMessage::PullResponse(_) => 2,
            SyncMessage::PushRequest(_) => 3,
            SyncMessage::PushResponse(_) => 4,
            SyncMessage::Error { .. } => 5,
        }
    }

    /// Encodes to CBOR, wrapped with the protocol version.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(&EnvelopeRef {
            version: PROTOCOL_VERSION,
            message: self,
        })
    }

    /// Decodes from CBOR, rejecting other protocol versions.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Envelope = decode_cbor(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: envelope.version,
            });
        }
        Ok(envelope.message)
    }
}
