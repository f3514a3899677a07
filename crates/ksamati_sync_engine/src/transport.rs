//! Remote store abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use ksamati_sync_protocol::{
    PullRequest, PullResponse, PushOutcome, PushRequest, PushResponse, PushResult,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// The central store as seen by a device.
///
/// `push` must be idempotent per entry id: a retried cycle resubmits
/// entries the store may already have applied.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches changes made by other devices after `request.since`.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Submits entries and returns one outcome per submission.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;
}

/// A scripted remote store for testing.
///
/// Pulls return the configured page (or an empty one). Pushes return the
/// configured response, or apply every submission at `local_version + 1`.
#[derive(Debug, Default)]
pub struct MockRemote {
    disconnected: AtomicBool,
    pull_response: Mutex<Option<PullResponse>>,
    push_response: Mutex<Option<PushResponse>>,
    pulls: Mutex<Vec<PullRequest>>,
    pushes: Mutex<Vec<PushRequest>>,
}

impl MockRemote {
    /// Creates a mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pull response.
    pub fn set_pull_response(&self, response: PullResponse) {
        *self.pull_response.lock() = Some(response);
    }

    /// Sets the push response.
    pub fn set_push_response(&self, response: PushResponse) {
        *self.push_response.lock() = Some(response);
    }

    /// Goes back to applying every submission.
    pub fn clear_push_response(&self) {
        *self.push_response.lock() = None;
    }

    /// Makes every call fail with a retryable transport error.
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Returns the pull requests received.
    pub fn pulls(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Returns the push requests received.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("not connected"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.check_connected()?;
        self.pulls.lock().push(request.clone());
        Ok(self
            .pull_response
            .lock()
            .clone()
            .unwrap_or_else(|| PullResponse::new(Vec::new(), request.since, false)))
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.check_connected()?;
        self.pushes.lock().push(request.clone());
        if let Some(response) = self.push_response.lock().clone() {
            return Ok(response);
        }
        let outcomes = request
            .submissions
            .iter()
            .map(|s| PushOutcome {
                entry_id: s.entry.id,
                result: PushResult::Applied {
                    server_version: s.entry.local_version + 1,
                },
            })
            .collect();
        Ok(PushResponse::new(outcomes))
    }
}
