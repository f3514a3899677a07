//! The sync coordinator: one pull, push and reconcile cycle per device.

use crate::config::SyncConfig;
use crate::detector::ConflictDetector;
use crate::error::{SyncError, SyncResult};
use crate::lease::DeviceLeases;
use crate::policy::{Decision, LastWriterWins, ResolutionPolicy};
use crate::state::{SyncCycleResult, SyncState, SyncStats};
use crate::transport::RemoteStore;
use chrono::Utc;
use ksamati_store::{CycleCommit, Settlement, StoreError, SyncStore};
use ksamati_sync_protocol::{
    ChangeEntry, ConflictId, DeviceId, PullRequest, PushRequest, PushResult, RemoteChange,
    RemoteState, Resolution, SubmitMode, Submission, SyncConflict,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Runs sync cycles between a [`SyncStore`] and a [`RemoteStore`].
///
/// A cycle pulls remote changes, pushes the device's pending entries,
/// reconciles the results and commits everything in one store batch. A
/// cycle that fails, times out or is cancelled commits nothing, so the next
/// cycle resubmits the same entries; the central store applies each entry
/// id at most once.
///
/// At most one cycle runs per device. Different devices sync independently.
pub struct SyncCoordinator<R: RemoteStore> {
    config: SyncConfig,
    store: Arc<SyncStore>,
    remote: Arc<R>,
    detector: ConflictDetector,
    policy: RwLock<Arc<dyn ResolutionPolicy>>,
    leases: DeviceLeases,
    states: RwLock<HashMap<DeviceId, SyncState>>,
    cancel_flags: Mutex<HashMap<DeviceId, Arc<AtomicBool>>>,
    stats: RwLock<SyncStats>,
}

/// A pushed submission with its outcome.
struct Delivered {
    submission: Submission,
    result: PushResult,
    decided: Option<SyncConflict>,
}

/// Everything a cycle stages before committing.
struct Staged {
    commit: CycleCommit,
    pulled: u64,
    pushed: u64,
    applied: Vec<ChangeEntry>,
    discarded: Vec<ChangeEntry>,
    detected: Vec<SyncConflict>,
    escalated: Vec<SyncConflict>,
    held: Vec<SyncConflict>,
}

/// Resets the device state to `Idle` if a cycle is dropped mid-flight.
struct StateTracker<'a> {
    states: &'a RwLock<HashMap<DeviceId, SyncState>>,
    device_id: DeviceId,
    finished: bool,
}

impl StateTracker<'_> {
    fn set(&self, state: SyncState) {
        self.states.write().insert(self.device_id.clone(), state);
    }

    fn finish(mut self, state: SyncState) {
        self.set(state);
        self.finished = true;
    }
}

impl Drop for StateTracker<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.set(SyncState::Idle);
        }
    }
}

impl<R: RemoteStore> SyncCoordinator<R> {
    /// Creates a coordinator using [`LastWriterWins`].
    pub fn new(config: SyncConfig, store: Arc<SyncStore>, remote: R) -> Self {
        Self {
            config,
            store,
            remote: Arc::new(remote),
            detector: ConflictDetector::new(),
            policy: RwLock::new(Arc::new(LastWriterWins)),
            leases: DeviceLeases::new(),
            states: RwLock::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Replaces the conflict policy.
    pub fn with_policy(self, policy: impl ResolutionPolicy + 'static) -> Self {
        self.set_policy(Arc::new(policy));
        self
    }

    /// Replaces the conflict policy for later cycles.
    pub fn set_policy(&self, policy: Arc<dyn ResolutionPolicy>) {
        *self.policy.write() = policy;
    }

    /// Returns the name of the conflict policy.
    pub fn policy_name(&self) -> &'static str {
        self.policy.read().name()
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Returns the remote store.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Returns the cycle state of a device.
    pub fn state(&self, device_id: &DeviceId) -> SyncState {
        self.states
            .read()
            .get(device_id)
            .copied()
            .unwrap_or(SyncState::Idle)
    }

    /// Returns statistics across all cycles.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels the running cycle of a device at its next step.
    pub fn cancel(&self, device_id: &DeviceId) {
        self.cancel_flag(device_id).store(true, Ordering::SeqCst);
    }

    fn cancel_flag(&self, device_id: &DeviceId) -> Arc<AtomicBool> {
        Arc::clone(
            self.cancel_flags
                .lock()
                .entry(device_id.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Returns the device's conflicts that await a decision, oldest first.
    pub fn pending_conflicts(&self, device_id: &DeviceId) -> Vec<SyncConflict> {
        self.store.conflicts().pending(device_id)
    }

    /// Records a decision on an open conflict.
    ///
    /// `RemoteWins` settles the entry at once. `LocalWins` and `Merged` are
    /// delivered by the device's next cycle.
    ///
    /// # Errors
    ///
    /// - [`SyncError::CycleInProgress`] while the device is syncing
    /// - [`SyncError::Store`] for unknown or closed conflicts, and for
    ///   [`Decision::Escalate`]
    pub fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        decision: Decision,
    ) -> SyncResult<SyncConflict> {
        let device_id = self
            .store
            .conflicts()
            .get(conflict_id)
            .map(|c| c.device_id)
            .ok_or(StoreError::UnknownConflict(*conflict_id))?;
        let _lease = self.leases.try_acquire(&device_id)?;

        let resolution = decision.resolution();
        let merged = match decision {
            Decision::Merged(payload) => Some(payload),
            _ => None,
        };
        Ok(self
            .store
            .decide_conflict(conflict_id, resolution, merged)?)
    }

    /// Runs one cycle for a device.
    ///
    /// # Errors
    ///
    /// - [`SyncError::CycleInProgress`] if the device is already syncing
    /// - [`SyncError::Cancelled`] after [`cancel`](Self::cancel)
    /// - [`SyncError::Timeout`] and transport errors from the remote store
    ///
    /// A failure other than cancellation is recorded in the device status.
    pub async fn sync(&self, device_id: &DeviceId) -> SyncResult<SyncCycleResult> {
        let _lease = self.leases.try_acquire(device_id)?;
        let cancelled = self.cancel_flag(device_id);
        cancelled.store(false, Ordering::SeqCst);

        let tracker = StateTracker {
            states: &self.states,
            device_id: device_id.clone(),
            finished: false,
        };
        let start = Instant::now();

        let outcome = self.run_cycle(device_id, &cancelled, &tracker).await;
        match outcome {
            Ok(mut result) => {
                result.duration = start.elapsed();
                tracker.finish(SyncState::Idle);
                self.record_success(&result);
                Ok(result)
            }
            Err(err) => {
                tracker.finish(SyncState::Failed);
                self.record_cycle_failure(device_id, &err);
                Err(err)
            }
        }
    }

    /// Runs cycles until one succeeds, backing off between retryable
    /// failures.
    pub async fn sync_with_retry(&self, device_id: &DeviceId) -> SyncResult<SyncCycleResult> {
        let retry = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                self.states
                    .write()
                    .insert(device_id.clone(), SyncState::RetryWait);
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                self.stats.write().retries += 1;

                if self.cancel_flag(device_id).load(Ordering::SeqCst) {
                    self.states
                        .write()
                        .insert(device_id.clone(), SyncState::Failed);
                    return Err(SyncError::Cancelled);
                }
            }

            match self.sync(device_id).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    tracing::debug!(device = %device_id, attempt, error = %err, "retrying sync");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Protocol("no sync attempts made".into())))
    }

    async fn run_cycle(
        &self,
        device_id: &DeviceId,
        cancelled: &AtomicBool,
        tracker: &StateTracker<'_>,
    ) -> SyncResult<SyncCycleResult> {
        let check_cancelled = || {
            if cancelled.load(Ordering::SeqCst) {
                Err(SyncError::Cancelled)
            } else {
                Ok(())
            }
        };
        let row = self.store.registry().cursor_row(device_id);

        tracker.set(SyncState::Pulling);
        let (incoming, remote_cursor) = self
            .pull_all(device_id, row.remote_cursor, &check_cancelled)
            .await?;

        tracker.set(SyncState::Pushing);
        let snapshot = self.store.change_log().snapshot(device_id);
        let cursor = row.cursor.max(snapshot.high_water);
        let mut staged = Staged {
            commit: CycleCommit::new(device_id.clone(), cursor, remote_cursor),
            pulled: incoming.len() as u64,
            pushed: 0,
            applied: Vec::new(),
            discarded: Vec::new(),
            detected: Vec::new(),
            escalated: Vec::new(),
            held: Vec::new(),
        };
        staged.commit.incoming = incoming;

        let mut delivered = Vec::new();
        let mut after_seq = 0;
        loop {
            check_cancelled()?;
            let batch = self.store.change_log().drain_range(
                device_id,
                snapshot,
                after_seq,
                self.config.push_limit(),
            );
            let Some(last) = batch.last() else {
                break;
            };
            after_seq = last.seq;

            let mut decided = HashMap::new();
            let mut submissions = Vec::new();
            for entry in batch {
                match self.store.conflicts().open_for_entry(&entry.id) {
                    Some(conflict) if conflict.awaits_delivery() => {
                        let submission = match &conflict.merged_payload {
                            Some(payload) if conflict.resolution == Resolution::Merged => {
                                Submission::merged(entry, payload.clone())
                            }
                            _ => Submission::force(entry),
                        };
                        decided.insert(conflict.entry_id, conflict);
                        submissions.push(submission);
                    }
                    Some(conflict) => staged.held.push(conflict),
                    None => submissions.push(Submission::normal(entry)),
                }
            }
            if submissions.is_empty() {
                continue;
            }

            let outcomes = self.push_batch(device_id, &submissions).await?;
            staged.pushed += submissions.len() as u64;
            check_cancelled()?;
            for (submission, result) in submissions.into_iter().zip(outcomes) {
                let decided = decided.remove(&submission.entry.id);
                delivered.push(Delivered {
                    submission,
                    result,
                    decided,
                });
            }
        }

        tracker.set(SyncState::Reconciling);
        let forced = self.reconcile(delivered, &mut staged)?;
        if !forced.is_empty() {
            self.deliver_forced(device_id, forced, &mut staged, &check_cancelled)
                .await?;
        }

        check_cancelled()?;
        self.commit(staged)
    }

    /// Pulls pages until the remote store has nothing more.
    async fn pull_all(
        &self,
        device_id: &DeviceId,
        since: u64,
        check_cancelled: &impl Fn() -> SyncResult<()>,
    ) -> SyncResult<(Vec<RemoteChange>, u64)> {
        let mut cursor = since;
        let mut changes = Vec::new();
        loop {
            check_cancelled()?;
            let request = PullRequest::new(device_id.clone(), cursor, self.config.pull_limit());
            let page = self.call(self.remote.pull(&request)).await?;
            check_cancelled()?;

            if page.cursor < cursor {
                tracing::error!(
                    device = %device_id,
                    current = cursor,
                    attempted = page.cursor,
                    "remote cursor moved backwards"
                );
                return Err(SyncError::OutOfOrder {
                    device_id: device_id.clone(),
                    current: cursor,
                    attempted: page.cursor,
                });
            }
            if page.has_more && page.cursor == cursor {
                return Err(SyncError::Protocol(
                    "pull reported more changes without advancing".into(),
                ));
            }

            tracing::debug!(
                device = %device_id,
                since = cursor,
                received = page.changes.len(),
                cursor = page.cursor,
                "pulled page"
            );
            cursor = page.cursor;
            changes.extend(page.changes);
            if !page.has_more {
                return Ok((changes, cursor));
            }
        }
    }

    /// Pushes one batch and returns its results in submission order.
    async fn push_batch(
        &self,
        device_id: &DeviceId,
        submissions: &[Submission],
    ) -> SyncResult<Vec<PushResult>> {
        let request = PushRequest::new(device_id.clone(), submissions.to_vec());
        let response = self.call(self.remote.push(&request)).await?;

        let mut by_entry: HashMap<_, _> = response
            .outcomes
            .into_iter()
            .map(|o| (o.entry_id, o.result))
            .collect();
        let results = submissions
            .iter()
            .map(|s| {
                by_entry.remove(&s.entry.id).ok_or_else(|| {
                    SyncError::Protocol(format!("no push outcome for entry {}", s.entry.id))
                })
            })
            .collect::<SyncResult<Vec<_>>>()?;

        tracing::debug!(
            device = %device_id,
            submitted = submissions.len(),
            "pushed batch"
        );
        Ok(results)
    }

    /// Settles applied entries and applies the policy to conflicts.
    ///
    /// Returns the force submissions the policy asked for.
    ///
    /// # Errors
    ///
    /// [`SyncError::Protocol`] if the remote reports a conflict at the
    /// version the entry was based on.
    fn reconcile(
        &self,
        delivered: Vec<Delivered>,
        staged: &mut Staged,
    ) -> SyncResult<Vec<(Submission, SyncConflict)>> {
        let now = Utc::now();
        let policy = Arc::clone(&*self.policy.read());
        let mut forced = Vec::new();

        for Delivered {
            submission,
            result,
            decided,
        } in delivered
        {
            let entry = submission.entry;
            match result {
                PushResult::Applied { server_version } => {
                    staged.settle_applied(entry, server_version, decided, now);
                }
                PushResult::Conflict(remote) if submission.mode == SubmitMode::Force => {
                    // A forced submission always applies; keep the entry pending.
                    tracing::warn!(
                        entry = %entry.id,
                        remote_version = remote.version,
                        "forced submission was not applied"
                    );
                }
                PushResult::Conflict(remote) => {
                    let Some(mut conflict) = self.detector.detect(&entry, &remote, now) else {
                        tracing::error!(
                            entry = %entry.id,
                            version = remote.version,
                            "conflict reported for matching versions"
                        );
                        return Err(SyncError::Protocol(format!(
                            "conflict reported for entry {} at its own version {}",
                            entry.id, remote.version
                        )));
                    };
                    let decision = policy.decide(&entry, &conflict);
                    let merged = match &decision {
                        Decision::Merged(payload) => Some(payload.clone()),
                        _ => None,
                    };
                    conflict.decide(decision.resolution(), merged);
                    staged.detected.push(conflict.clone());

                    match decision {
                        Decision::LocalWins => {
                            forced.push((Submission::force(entry), conflict));
                        }
                        Decision::Merged(payload) => {
                            forced.push((Submission::merged(entry, payload), conflict));
                        }
                        Decision::RemoteWins => {
                            staged.discard(entry, &remote, conflict, now);
                        }
                        Decision::Escalate => {
                            tracing::warn!(
                                conflict = %conflict.id,
                                entity = %conflict.key(),
                                policy = policy.name(),
                                "conflict escalated for a decision"
                            );
                            staged.commit.conflicts.push(conflict.clone());
                            staged.escalated.push(conflict);
                        }
                    }
                }
            }
        }
        Ok(forced)
    }

    /// Delivers the policy's force submissions.
    async fn deliver_forced(
        &self,
        device_id: &DeviceId,
        forced: Vec<(Submission, SyncConflict)>,
        staged: &mut Staged,
        check_cancelled: &impl Fn() -> SyncResult<()>,
    ) -> SyncResult<()> {
        let batch_size = self.config.push_limit();
        let mut pending = forced.into_iter().peekable();
        while pending.peek().is_some() {
            check_cancelled()?;
            let (submissions, conflicts): (Vec<_>, Vec<_>) =
                pending.by_ref().take(batch_size).unzip();
            let results = self.push_batch(device_id, &submissions).await?;
            staged.pushed += submissions.len() as u64;

            let now = Utc::now();
            for ((submission, conflict), result) in
                submissions.into_iter().zip(conflicts).zip(results)
            {
                match result {
                    PushResult::Applied { server_version } => {
                        staged.settle_applied(
                            submission.entry,
                            server_version,
                            Some(conflict),
                            now,
                        );
                    }
                    PushResult::Conflict(_) => {
                        // Record the decision so the next cycle retries delivery.
                        tracing::warn!(
                            entry = %submission.entry.id,
                            "forced submission was not applied"
                        );
                        staged.commit.conflicts.push(conflict);
                    }
                }
            }
        }
        Ok(())
    }

    fn commit(&self, staged: Staged) -> SyncResult<SyncCycleResult> {
        let Staged {
            commit,
            pulled,
            pushed,
            applied,
            discarded,
            detected,
            escalated,
            held,
        } = staged;
        let device_id = commit.device_id.clone();
        let cursor = commit.cursor;
        let remote_cursor = commit.remote_cursor;

        let status = self.store.commit_cycle(commit)?;

        Ok(SyncCycleResult {
            device_id,
            pulled,
            pushed,
            applied: applied.iter().map(|e| e.id).collect(),
            discarded: discarded.iter().map(|e| e.id).collect(),
            conflicts: detected,
            escalated,
            held,
            cursor,
            remote_cursor,
            pending_count: status.pending_count,
            duration: Default::default(),
        })
    }

    async fn call<T>(&self, request: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.config.timeout, request)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    fn record_success(&self, result: &SyncCycleResult) {
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.changes_pulled += result.pulled;
            stats.entries_pushed += result.pushed;
            stats.entries_applied += result.applied.len() as u64;
            stats.conflicts_detected += result.conflicts.len() as u64;
            stats.conflicts_escalated += result.escalated.len() as u64;
            stats.last_sync_at = Some(Utc::now());
            stats.last_error = None;
        }

        tracing::info!(
            device = %result.device_id,
            pulled = result.pulled,
            pushed = result.pushed,
            applied = result.applied.len(),
            conflicts = result.conflicts.len(),
            escalated = result.escalated.len(),
            held = result.held.len(),
            cursor = result.cursor,
            pending = result.pending_count,
            "sync cycle completed"
        );
    }

    fn record_cycle_failure(&self, device_id: &DeviceId, err: &SyncError) {
        {
            let mut stats = self.stats.write();
            stats.cycles_failed += 1;
            stats.last_error = Some(err.to_string());
        }

        if matches!(err, SyncError::Cancelled) {
            tracing::info!(device = %device_id, "sync cycle cancelled");
            return;
        }
        tracing::warn!(device = %device_id, error = %err, "sync cycle failed");
        if let Err(store_err) = self.store.registry().record_failure(device_id, &err.to_string()) {
            tracing::error!(
                device = %device_id,
                error = %store_err,
                "failed to record sync failure"
            );
        }
    }
}

impl Staged {
    fn settle_applied(
        &mut self,
        entry: ChangeEntry,
        server_version: u64,
        decided: Option<SyncConflict>,
        now: chrono::DateTime<Utc>,
    ) {
        self.commit
            .settled
            .push(Settlement::applied(entry.id, server_version));
        if let Some(mut conflict) = decided {
            conflict.close(now);
            self.commit.conflicts.push(conflict);
        }
        self.applied.push(entry);
    }

    fn discard(
        &mut self,
        entry: ChangeEntry,
        remote: &RemoteState,
        mut conflict: SyncConflict,
        now: chrono::DateTime<Utc>,
    ) {
        conflict.close(now);
        self.commit.settled.push(Settlement {
            entry_id: entry.id,
            server_version: Some(remote.version),
        });
        self.commit.conflicts.push(conflict);
        self.discarded.push(entry);
    }
}
