//! Central entity state and change feed.

use chrono::{DateTime, Utc};
use ksamati_sync_protocol::{
    ChangeEntry, DeviceId, EntityKey, EntryId, Operation, Payload, PushResult, RemoteChange,
    RemoteState, SubmitMode, Submission,
};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Current server-side state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    /// Version, incremented by every applied change.
    pub version: u64,
    /// Current document (`None` once deleted).
    pub payload: Option<Payload>,
    /// Whether the entity is deleted.
    pub deleted: bool,
    /// `created_at` of the change that produced this version.
    pub updated_at: DateTime<Utc>,
}

impl EntityState {
    fn remote_state(&self) -> RemoteState {
        RemoteState {
            version: self.version,
            payload: self.payload.clone(),
            deleted: self.deleted,
            created_at: Some(self.updated_at),
        }
    }
}

#[derive(Debug, Default)]
struct CentralState {
    entities: HashMap<EntityKey, EntityState>,
    feed: Vec<RemoteChange>,
    /// Entry id -> version it produced.
    applied: HashMap<EntryId, u64>,
}

/// The central store: authoritative entity versions plus a feed of every
/// applied change.
///
/// Applying is idempotent per entry id: resubmitting an entry that was
/// already applied returns the original result and changes nothing.
#[derive(Debug, Default)]
pub struct CentralStore {
    state: RwLock<CentralState>,
}

impl CentralStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one submission.
    pub fn apply(&self, submission: &Submission) -> PushResult {
        let mut state = self.state.write();
        let entry = &submission.entry;
        if let Some(version) = state.applied.get(&entry.id) {
            tracing::debug!(entry = %entry.id, "entry already applied");
            return PushResult::Applied {
                server_version: *version,
            };
        }

        let key = entry.key();
        let current = state.entities.get(&key);
        let current_version = current.map_or(0, |s| s.version);
        if submission.mode == SubmitMode::Normal && entry.local_version != current_version {
            let remote = current.map_or_else(RemoteState::absent, EntityState::remote_state);
            tracing::debug!(
                entity = %key,
                local_version = entry.local_version,
                server_version = current_version,
                "version conflict"
            );
            return PushResult::Conflict(remote);
        }

        let server_version = current_version + 1;
        let deleted = entry.operation == Operation::Delete;
        let payload = if deleted {
            None
        } else {
            submission.effective_payload().cloned()
        };
        state.entities.insert(
            key,
            EntityState {
                version: server_version,
                payload: payload.clone(),
                deleted,
                updated_at: entry.created_at,
            },
        );

        let applied = ChangeEntry {
            payload,
            ..entry.clone()
        };
        let feed_seq = state.feed.len() as u64 + 1;
        state.feed.push(RemoteChange {
            feed_seq,
            server_version,
            entry: applied,
        });
        state.applied.insert(entry.id, server_version);

        PushResult::Applied { server_version }
    }

    /// Returns up to `limit` changes made by other devices after `since`.
    ///
    /// The returned cursor also moves past the requester's own changes, so
    /// they are skipped on the next pull as well.
    pub fn changes_since(
        &self,
        device_id: &DeviceId,
        since: u64,
        limit: usize,
    ) -> (Vec<RemoteChange>, u64, bool) {
        let state = self.state.read();
        let mut changes = Vec::new();
        let mut cursor = since;
        let mut has_more = false;

        let start = (since as usize).min(state.feed.len());
        for change in &state.feed[start..] {
            if &change.entry.device_id == device_id {
                cursor = change.feed_seq;
                continue;
            }
            if changes.len() == limit {
                has_more = true;
                break;
            }
            cursor = change.feed_seq;
            changes.push(change.clone());
        }
        (changes, cursor, has_more)
    }

    /// Returns the current state of an entity.
    pub fn entity(&self, key: &EntityKey) -> Option<EntityState> {
        self.state.read().entities.get(key).cloned()
    }

    /// Returns the current version of an entity, or 0.
    pub fn version(&self, key: &EntityKey) -> u64 {
        self.state.read().entities.get(key).map_or(0, |s| s.version)
    }

    /// Returns the number of applied changes.
    pub fn feed_len(&self) -> usize {
        self.state.read().feed.len()
    }

    /// Returns the feed changes produced by one entry id.
    pub fn applications_of(&self, entry_id: &EntryId) -> usize {
        self.state
            .read()
            .feed
            .iter()
            .filter(|c| &c.entry.id == entry_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_sync_protocol::NewChange;
    use serde_json::json;

    fn entry(device: &str, id: &str, version: u64) -> ChangeEntry {
        let change = if version == 0 {
            NewChange::create(DeviceId::new(device), "milestone", id, json!({"v": version}))
        } else {
            NewChange::update(DeviceId::new(device), "milestone", id, version, json!({"v": version}))
        };
        ChangeEntry::from_new(change, 1, Utc::now())
    }

    #[test]
    fn apply_increments_version() {
        let store = CentralStore::new();
        let key = EntityKey::new("milestone", "M-1");

        let result = store.apply(&Submission::normal(entry("a", "M-1", 0)));
        assert_eq!(result, PushResult::Applied { server_version: 1 });
        let result = store.apply(&Submission::normal(entry("a", "M-1", 1)));
        assert_eq!(result, PushResult::Applied { server_version: 2 });
        assert_eq!(store.version(&key), 2);
        assert_eq!(store.feed_len(), 2);
    }

    #[test]
    fn stale_version_conflicts() {
        let store = CentralStore::new();
        store.apply(&Submission::normal(entry("a", "M-1", 0)));
        store.apply(&Submission::normal(entry("a", "M-1", 1)));

        match store.apply(&Submission::normal(entry("b", "M-1", 1))) {
            PushResult::Conflict(remote) => {
                assert_eq!(remote.version, 2);
                assert_eq!(remote.payload, Some(json!({"v": 1})));
                assert!(!remote.deleted);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(store.feed_len(), 2);
    }

    #[test]
    fn create_of_existing_entity_conflicts() {
        let store = CentralStore::new();
        store.apply(&Submission::normal(entry("a", "M-1", 0)));
        assert!(matches!(
            store.apply(&Submission::normal(entry("b", "M-1", 0))),
            PushResult::Conflict(_)
        ));
    }

    #[test]
    fn update_of_missing_entity_conflicts_with_absent_state() {
        let store = CentralStore::new();
        match store.apply(&Submission::normal(entry("a", "M-9", 3))) {
            PushResult::Conflict(remote) => assert_eq!(remote, RemoteState::absent()),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn force_and_merge_overwrite() {
        let store = CentralStore::new();
        let key = EntityKey::new("milestone", "M-1");
        store.apply(&Submission::normal(entry("a", "M-1", 0)));
        store.apply(&Submission::normal(entry("a", "M-1", 1)));

        let forced = store.apply(&Submission::force(entry("b", "M-1", 1)));
        assert_eq!(forced, PushResult::Applied { server_version: 3 });

        let merged = store.apply(&Submission::merged(entry("c", "M-1", 1), json!({"v": "merged"})));
        assert_eq!(merged, PushResult::Applied { server_version: 4 });
        assert_eq!(store.entity(&key).unwrap().payload, Some(json!({"v": "merged"})));
    }

    #[test]
    fn resubmission_is_idempotent() {
        let store = CentralStore::new();
        let e = entry("a", "M-1", 0);
        let first = store.apply(&Submission::normal(e.clone()));
        let again = store.apply(&Submission::normal(e.clone()));

        assert_eq!(first, again);
        assert_eq!(store.applications_of(&e.id), 1);
        assert_eq!(store.feed_len(), 1);
    }

    #[test]
    fn delete_clears_payload() {
        let store = CentralStore::new();
        store.apply(&Submission::normal(entry("a", "M-1", 0)));
        let delete = ChangeEntry::from_new(
            NewChange::delete(DeviceId::new("a"), "milestone", "M-1", 1),
            2,
            Utc::now(),
        );
        store.apply(&Submission::normal(delete));

        let state = store.entity(&EntityKey::new("milestone", "M-1")).unwrap();
        assert!(state.deleted);
        assert!(state.payload.is_none());
    }

    #[test]
    fn changes_since_skips_own_changes() {
        let store = CentralStore::new();
        store.apply(&Submission::normal(entry("a", "M-1", 0)));
        store.apply(&Submission::normal(entry("b", "M-2", 0)));
        store.apply(&Submission::normal(entry("a", "M-3", 0)));
        store.apply(&Submission::normal(entry("b", "M-4", 0)));

        let (changes, cursor, has_more) = store.changes_since(&DeviceId::new("a"), 0, 10);
        let ids: Vec<&str> = changes.iter().map(|c| c.entry.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["M-2", "M-4"]);
        assert_eq!(cursor, 4);
        assert!(!has_more);

        let (page, cursor, has_more) = store.changes_since(&DeviceId::new("a"), 0, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(cursor, 2);
        assert!(has_more);

        let (rest, cursor, has_more) = store.changes_since(&DeviceId::new("a"), cursor, 1);
        assert_eq!(rest[0].entry.entity_id, "M-4");
        assert_eq!(cursor, 4);
        assert!(!has_more);
    }
}
