//! Conflict detection.

use chrono::{DateTime, Utc};
use ksamati_sync_protocol::{ChangeEntry, RemoteState, SyncConflict};

/// Outcome of comparing a local entry with the server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCheck {
    /// The entry was based on the current server version.
    NoConflict,
    /// The entry was based on a different version.
    Conflict {
        /// Version the entry was based on.
        local_version: u64,
        /// Current server version.
        server_version: u64,
    },
}

impl ConflictCheck {
    /// Returns true for [`ConflictCheck::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, ConflictCheck::Conflict { .. })
    }
}

/// Classifies entries against server versions.
///
/// The detector never resolves anything; it only decides whether a conflict
/// exists and builds the pending record for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Creates a detector.
    pub fn new() -> Self {
        Self
    }

    /// Compares an entry's `local_version` with the server version.
    pub fn check(&self, entry: &ChangeEntry, server_version: u64) -> ConflictCheck {
        if entry.local_version == server_version {
            ConflictCheck::NoConflict
        } else {
            ConflictCheck::Conflict {
                local_version: entry.local_version,
                server_version,
            }
        }
    }

    /// Builds a pending conflict record if the entry conflicts with `remote`.
    pub fn detect(
        &self,
        entry: &ChangeEntry,
        remote: &RemoteState,
        detected_at: DateTime<Utc>,
    ) -> Option<SyncConflict> {
        match self.check(entry, remote.version) {
            ConflictCheck::NoConflict => None,
            ConflictCheck::Conflict { .. } => {
                tracing::debug!(
                    entry = %entry.id,
                    entity = %entry.key(),
                    local_version = entry.local_version,
                    server_version = remote.version,
                    "conflict detected"
                );
                Some(SyncConflict::pending(entry, remote, detected_at))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_sync_protocol::{DeviceId, NewChange, Resolution};
    use serde_json::json;

    fn entry(local_version: u64) -> ChangeEntry {
        ChangeEntry::from_new(
            NewChange::update(
                DeviceId::new("site-laptop"),
                "contract",
                "C-7",
                local_version,
                json!({"status": "signed"}),
            ),
            1,
            Utc::now(),
        )
    }

    fn remote(version: u64) -> RemoteState {
        RemoteState {
            version,
            payload: Some(json!({"status": "draft"})),
            deleted: false,
            created_at: Some(Utc::now()),
        }
    }

    #[test]
    fn equal_versions_do_not_conflict() {
        let detector = ConflictDetector::new();
        assert_eq!(detector.check(&entry(3), 3), ConflictCheck::NoConflict);
    }

    #[test]
    fn newer_server_version_conflicts() {
        let detector = ConflictDetector::new();
        let check = detector.check(&entry(3), 4);
        assert_eq!(
            check,
            ConflictCheck::Conflict {
                local_version: 3,
                server_version: 4
            }
        );
        assert!(check.is_conflict());
    }

    #[test]
    fn detect_builds_pending_record() {
        let detector = ConflictDetector::new();
        let entry = entry(3);
        assert!(detector.detect(&entry, &remote(3), Utc::now()).is_none());

        let conflict = detector.detect(&entry, &remote(5), Utc::now()).unwrap();
        assert_eq!(conflict.entry_id, entry.id);
        assert_eq!(conflict.local_version, 3);
        assert_eq!(conflict.remote_version, 5);
        assert_eq!(conflict.resolution, Resolution::Pending);
        assert_eq!(conflict.remote_payload, Some(json!({"status": "draft"})));
    }
}
