//! Cycle states, statistics and results.

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use ksamati_sync_protocol::{DeviceId, EntryId, SyncConflict};
use std::time::Duration;

/// The state of a device's sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle is running.
    Idle,
    /// Fetching remote changes.
    Pulling,
    /// Submitting pending entries.
    Pushing,
    /// Settling results and applying the conflict policy.
    Reconciling,
    /// The last cycle failed.
    Failed,
    /// Waiting before a retry.
    RetryWait,
}

impl SyncState {
    /// Returns true while a cycle is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::Reconciling
        )
    }

    /// Returns true if a new cycle may start.
    pub fn can_start_sync(&self) -> bool {
        matches!(
            self,
            SyncState::Idle | SyncState::Failed | SyncState::RetryWait
        )
    }
}

/// Statistics across all cycles run by a coordinator.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that committed.
    pub cycles_completed: u64,
    /// Cycles that failed or were cancelled.
    pub cycles_failed: u64,
    /// Remote changes recorded.
    pub changes_pulled: u64,
    /// Submissions sent, force resubmissions included.
    pub entries_pushed: u64,
    /// Entries settled as applied.
    pub entries_applied: u64,
    /// Conflicts detected.
    pub conflicts_detected: u64,
    /// Conflicts left for a human.
    pub conflicts_escalated: u64,
    /// Retries after a failed attempt.
    pub retries: u64,
    /// When the last cycle committed.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a committed cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Device the cycle ran for.
    pub device_id: DeviceId,
    /// Remote changes received.
    pub pulled: u64,
    /// Submissions sent.
    pub pushed: u64,
    /// Entries the central store applied.
    pub applied: Vec<EntryId>,
    /// Entries discarded because the server version won.
    pub discarded: Vec<EntryId>,
    /// Conflicts detected by this cycle, whatever their outcome.
    pub conflicts: Vec<SyncConflict>,
    /// Conflicts this cycle escalated for a decision.
    pub escalated: Vec<SyncConflict>,
    /// Earlier undecided conflicts whose entries were held back.
    pub held: Vec<SyncConflict>,
    /// Local cursor after the cycle.
    pub cursor: u64,
    /// Central feed position after the cycle.
    pub remote_cursor: u64,
    /// Entries of the device still pending.
    pub pending_count: u64,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if every drained entry settled.
    pub fn is_clean(&self) -> bool {
        self.escalated.is_empty() && self.held.is_empty()
    }

    /// Returns [`SyncError::ConflictUnresolved`] for the oldest conflict
    /// still awaiting a decision, if any.
    pub fn unresolved_error(&self) -> Option<SyncError> {
        self.held
            .iter()
            .chain(&self.escalated)
            .next()
            .map(|c| SyncError::ConflictUnresolved {
                conflict_id: c.id,
                entity: c.key(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksamati_sync_protocol::{ChangeEntry, NewChange, RemoteState};
    use serde_json::json;

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Failed.can_start_sync());
        assert!(SyncState::RetryWait.can_start_sync());
        assert!(!SyncState::Pulling.can_start_sync());
        assert!(!SyncState::Reconciling.can_start_sync());

        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::Pushing.is_active());
        assert!(SyncState::Reconciling.is_active());
        assert!(!SyncState::Idle.is_active());
    }

    #[test]
    fn unresolved_error_names_the_entity() {
        let entry = ChangeEntry::from_new(
            NewChange::update(DeviceId::new("d"), "expense", "E-1", 1, json!({})),
            1,
            Utc::now(),
        );
        let conflict = SyncConflict::pending(&entry, &RemoteState::absent(), Utc::now());
        let mut result = SyncCycleResult {
            device_id: DeviceId::new("d"),
            pulled: 0,
            pushed: 1,
            applied: Vec::new(),
            discarded: Vec::new(),
            conflicts: vec![conflict.clone()],
            escalated: Vec::new(),
            held: Vec::new(),
            cursor: 1,
            remote_cursor: 0,
            pending_count: 1,
            duration: Duration::ZERO,
        };
        assert!(result.is_clean());
        assert!(result.unresolved_error().is_none());

        result.escalated.push(conflict.clone());
        assert!(!result.is_clean());
        match result.unresolved_error() {
            Some(SyncError::ConflictUnresolved { conflict_id, entity }) => {
                assert_eq!(conflict_id, conflict.id);
                assert_eq!(entity.to_string(), conflict.key().to_string());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
