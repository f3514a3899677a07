//! Conflict resolution policies.

use chrono::{DateTime, Utc};
use ksamati_sync_protocol::{ChangeEntry, Payload, Resolution, SyncConflict};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// What to do with a conflicted entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Overwrite the server version with the local entry.
    LocalWins,
    /// Keep the server version and discard the local entry.
    RemoteWins,
    /// Overwrite the server version with a merged document.
    Merged(Payload),
    /// Leave the conflict pending for a human.
    Escalate,
}

impl Decision {
    /// Returns the resolution recorded for this decision.
    pub fn resolution(&self) -> Resolution {
        match self {
            Decision::LocalWins => Resolution::LocalWins,
            Decision::RemoteWins => Resolution::RemoteWins,
            Decision::Merged(_) => Resolution::Merged,
            Decision::Escalate => Resolution::Pending,
        }
    }
}

/// Decides conflicts detected while pushing.
pub trait ResolutionPolicy: Send + Sync {
    /// Returns a decision for `entry`, which conflicted as described by
    /// `conflict`.
    fn decide(&self, entry: &ChangeEntry, conflict: &SyncConflict) -> Decision;

    /// Returns a short name for logs.
    fn name(&self) -> &'static str;
}

/// Newest `created_at` wins; ties go to the server.
///
/// An entity the server has never written has no timestamp, so the local
/// entry wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ResolutionPolicy for LastWriterWins {
    fn decide(&self, entry: &ChangeEntry, conflict: &SyncConflict) -> Decision {
        match conflict.remote_created_at {
            Some(remote_at) if entry.created_at > remote_at => Decision::LocalWins,
            Some(_) => Decision::RemoteWins,
            None => Decision::LocalWins,
        }
    }

    fn name(&self) -> &'static str {
        "last-writer-wins"
    }
}

/// The local entry always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ResolutionPolicy for LocalWins {
    fn decide(&self, _entry: &ChangeEntry, _conflict: &SyncConflict) -> Decision {
        Decision::LocalWins
    }

    fn name(&self) -> &'static str {
        "local-wins"
    }
}

/// The server version always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ResolutionPolicy for RemoteWins {
    fn decide(&self, _entry: &ChangeEntry, _conflict: &SyncConflict) -> Decision {
        Decision::RemoteWins
    }

    fn name(&self) -> &'static str {
        "remote-wins"
    }
}

/// Every conflict waits for a human.
#[derive(Debug, Clone, Copy, Default)]
pub struct Manual;

impl ResolutionPolicy for Manual {
    fn decide(&self, _entry: &ChangeEntry, _conflict: &SyncConflict) -> Decision {
        Decision::Escalate
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Merge function: returns the merged document, or `None` if the two sides
/// cannot be merged.
pub type MergeFn = Arc<dyn Fn(&ChangeEntry, &SyncConflict) -> Option<Payload> + Send + Sync>;

/// Merges both sides with a merge function; escalates when there is none or
/// it gives up.
#[derive(Clone, Default)]
pub struct MergePolicy {
    merge: Option<MergeFn>,
}

impl MergePolicy {
    /// Creates a merge policy without a merge function (always escalates).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a merge policy with a merge function.
    pub fn with_merge_fn<F>(merge: F) -> Self
    where
        F: Fn(&ChangeEntry, &SyncConflict) -> Option<Payload> + Send + Sync + 'static,
    {
        Self {
            merge: Some(Arc::new(merge)),
        }
    }

    /// Creates a merge policy using [`json_field_merge`].
    ///
    /// Deletes on either side are not merged.
    pub fn json_fields() -> Self {
        Self::with_merge_fn(|entry, conflict| {
            let local = entry.payload.as_ref()?;
            let remote = conflict.remote_payload.as_ref()?;
            let remote_at = conflict.remote_created_at.unwrap_or(entry.created_at);
            Some(json_field_merge(local, remote, entry.created_at, remote_at))
        })
    }

    /// Returns true if a merge function is configured.
    pub fn has_merge_fn(&self) -> bool {
        self.merge.is_some()
    }
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergePolicy")
            .field("has_merge_fn", &self.has_merge_fn())
            .finish()
    }
}

impl ResolutionPolicy for MergePolicy {
    fn decide(&self, entry: &ChangeEntry, conflict: &SyncConflict) -> Decision {
        match self.merge.as_ref().and_then(|merge| merge(entry, conflict)) {
            Some(merged) => Decision::Merged(merged),
            None => Decision::Escalate,
        }
    }

    fn name(&self) -> &'static str {
        "merge"
    }
}

/// Merges two JSON documents field by field.
///
/// Objects merge recursively and keys present on one side only are kept.
/// Arrays are concatenated without duplicates. For any other pair the newer
/// side wins, and the local side on a tie.
pub fn json_field_merge(
    local: &Value,
    remote: &Value,
    local_at: DateTime<Utc>,
    remote_at: DateTime<Utc>,
) -> Value {
    match (local, remote) {
        (Value::Object(local_map), Value::Object(remote_map)) => {
            let mut merged = Map::new();
            for (key, value) in local_map {
                merged.insert(key.clone(), value.clone());
            }
            for (key, remote_value) in remote_map {
                let value = match local_map.get(key) {
                    Some(local_value) => {
                        json_field_merge(local_value, remote_value, local_at, remote_at)
                    }
                    None => remote_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (Value::Array(local_arr), Value::Array(remote_arr)) => {
            let mut merged = local_arr.clone();
            for item in remote_arr {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        _ => {
            if remote_at > local_at {
                remote.clone()
            } else {
                local.clone()
            }
        }
    }
}
