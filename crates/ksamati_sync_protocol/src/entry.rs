//! Change entries: durable records of local mutations.

use crate::device::DeviceId;
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Entity document carried by create and update operations.
pub type Payload = serde_json::Value;

/// Maximum length of an entity type name.
const MAX_ENTITY_TYPE_LEN: usize = 64;

/// Unique identifier of a change entry.
///
/// The central store deduplicates submissions by this id, which is what
/// makes retried pushes safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generates a fresh random entry id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of record a change applies to (`contract`, `expense`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityType(String);

impl EntityType {
    /// Creates an entity type. Validity is checked when the change is appended.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the name is an identifier of acceptable length.
    pub fn is_valid(&self) -> bool {
        let mut chars = self.0.chars();
        let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        starts_alpha
            && self.0.len() <= MAX_ENTITY_TYPE_LEN
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Identity of an entity across devices and the central store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id, unique within its type.
    pub entity_id: String,
}

impl EntityKey {
    /// Creates an entity key.
    pub fn new(entity_type: impl Into<EntityType>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Kind of mutation recorded by a change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

impl Operation {
    /// Returns true if this operation must carry a payload.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, Operation::Delete)
    }

    /// Returns the lowercase name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation submitted by the UI, before the log assigns id and sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    /// Originating device.
    pub device_id: DeviceId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Entity document (create/update only).
    pub payload: Option<Payload>,
    /// Server version this change was based on.
    pub local_version: u64,
    /// Creation time; the log stamps the current time when absent.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewChange {
    /// A create of a brand-new entity (based on version 0).
    pub fn create(
        device_id: DeviceId,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            device_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Create,
            payload: Some(payload),
            local_version: 0,
            created_at: None,
        }
    }

    /// An update based on `local_version` of the entity.
    pub fn update(
        device_id: DeviceId,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        local_version: u64,
        payload: Payload,
    ) -> Self {
        Self {
            device_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Update,
            payload: Some(payload),
            local_version,
            created_at: None,
        }
    }

    /// A delete based on `local_version` of the entity.
    pub fn delete(
        device_id: DeviceId,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        local_version: u64,
    ) -> Self {
        Self {
            device_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Delete,
            payload: None,
            local_version,
            created_at: None,
        }
    }

    /// Sets an explicit creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Checks required fields and operation/payload agreement.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(
            &self.device_id,
            &self.entity_type,
            &self.entity_id,
            self.operation,
            self.payload.as_ref(),
        )
    }
}

/// A durable record of one local mutation.
///
/// Immutable once created, except for `synced_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Entry id.
    pub id: EntryId,
    /// Originating device.
    pub device_id: DeviceId,
    /// Per-device sequence number, assigned at append.
    pub seq: u64,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Entity document (create/update only).
    pub payload: Option<Payload>,
    /// Server version this change was based on.
    pub local_version: u64,
    /// When the mutation was made.
    pub created_at: DateTime<Utc>,
    /// When the entry was settled with the central store.
    pub synced_at: Option<DateTime<Utc>>,
}

impl ChangeEntry {
    /// Builds a pending entry from a validated [`NewChange`].
    pub fn from_new(change: NewChange, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            device_id: change.device_id,
            seq,
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            operation: change.operation,
            payload: change.payload,
            local_version: change.local_version,
            created_at: change.created_at.unwrap_or(now),
            synced_at: None,
        }
    }

    /// Returns the entity this entry mutates.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Returns true while the entry awaits settlement.
    pub fn is_pending(&self) -> bool {
        self.synced_at.is_none()
    }

    /// Checks required fields and operation/payload agreement.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(
            &self.device_id,
            &self.entity_type,
            &self.entity_id,
            self.operation,
            self.payload.as_ref(),
        )
    }
}

fn validate_fields(
    device_id: &DeviceId,
    entity_type: &EntityType,
    entity_id: &str,
    operation: Operation,
    payload: Option<&Payload>,
) -> Result<(), ValidationError> {
    if device_id.as_str().trim().is_empty() {
        return Err(ValidationError::MissingField("device_id"));
    }
    if entity_type.as_str().is_empty() {
        return Err(ValidationError::MissingField("entity_type"));
    }
    if !entity_type.is_valid() {
        return Err(ValidationError::InvalidEntityType(
            entity_type.as_str().to_string(),
        ));
    }
    if entity_id.trim().is_empty() {
        return Err(ValidationError::MissingField("entity_id"));
    }
    match (operation.requires_payload(), payload) {
        (true, None) | (true, Some(Payload::Null)) => {
            Err(ValidationError::PayloadRequired(operation))
        }
        (false, Some(_)) => Err(ValidationError::PayloadNotAllowed),
        _ => Ok(()),
    }
}
