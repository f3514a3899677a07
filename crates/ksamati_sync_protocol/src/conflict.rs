//! Sync conflicts and their resolutions.

use crate::device::DeviceId;
use crate::entry::{ChangeEntry, EntityKey, EntityType, EntryId, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a sync conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Generates a fresh random conflict id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome chosen for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Awaiting a decision.
    Pending,
    /// Local entry overwrites the server version.
    LocalWins,
    /// Server version stands; the local entry is discarded.
    RemoteWins,
    /// A merged document replaces both.
    Merged,
}

impl Resolution {
    /// Returns the kebab-case name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::LocalWins => "local-wins",
            Resolution::RemoteWins => "remote-wins",
            Resolution::Merged => "merged",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of an entity in the central store at apply time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteState {
    /// Current server version (0 if the entity was never written).
    pub version: u64,
    /// Current document, `None` when absent or deleted.
    pub payload: Option<Payload>,
    /// Whether the entity is deleted on the server.
    pub deleted: bool,
    /// Creation time of the change that produced this version.
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteState {
    /// State of an entity the server has never seen.
    pub fn absent() -> Self {
        Self {
            version: 0,
            payload: None,
            deleted: false,
            created_at: None,
        }
    }
}

/// A recorded divergence between a local entry and the server version
/// (`sync_conflicts` row).
///
/// A conflict is open until `resolved_at` is set. A decided but open
/// conflict (`LocalWins` or `Merged`) still has to be delivered to the
/// central store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict id.
    pub id: ConflictId,
    /// Entry that conflicted.
    pub entry_id: EntryId,
    /// Device that produced the entry.
    pub device_id: DeviceId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Version the local entry was based on.
    pub local_version: u64,
    /// Server version at apply time.
    pub remote_version: u64,
    /// Server document at apply time.
    pub remote_payload: Option<Payload>,
    /// Creation time of the server's current version.
    pub remote_created_at: Option<DateTime<Utc>>,
    /// Chosen outcome.
    pub resolution: Resolution,
    /// Document to deliver for a manual `Merged` decision.
    pub merged_payload: Option<Payload>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// When the outcome took effect.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    /// Records a pending conflict between `entry` and `remote`.
    pub fn pending(entry: &ChangeEntry, remote: &RemoteState, detected_at: DateTime<Utc>) -> Self {
        Self {
            id: ConflictId::new(),
            entry_id: entry.id,
            device_id: entry.device_id.clone(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            local_version: entry.local_version,
            remote_version: remote.version,
            remote_payload: remote.payload.clone(),
            remote_created_at: remote.created_at,
            resolution: Resolution::Pending,
            merged_payload: None,
            detected_at,
            resolved_at: None,
        }
    }

    /// Returns the conflicted entity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Returns true until the outcome has taken effect.
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Returns true if the conflict is open and nobody has decided yet.
    pub fn is_undecided(&self) -> bool {
        self.is_open() && self.resolution == Resolution::Pending
    }

    /// Returns true if a decision was made but not yet delivered.
    pub fn awaits_delivery(&self) -> bool {
        self.is_open() && matches!(self.resolution, Resolution::LocalWins | Resolution::Merged)
    }

    /// Records a decision without closing the conflict.
    pub fn decide(&mut self, resolution: Resolution, merged_payload: Option<Payload>) {
        self.resolution = resolution;
        self.merged_payload = merged_payload;
    }

    /// Closes the conflict.
    pub fn close(&mut self, at: DateTime<Utc>) {
        self.resolved_at = Some(at);
    }
}
