//! Request handlers for pull and push.

use crate::central::CentralStore;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use ksamati_sync_protocol::{
    DeviceId, PullRequest, PullResponse, PushOutcome, PushRequest, PushResponse, PushResult,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Central store (shared across all handlers).
    pub store: Arc<CentralStore>,
    sessions: RwLock<HashMap<DeviceId, DeviceSession>>,
}

/// What the server has seen from one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSession {
    /// Cursor returned by the device's last pull.
    pub last_cursor: u64,
    /// Submissions applied for the device.
    pub applied: u64,
    /// Submissions rejected with a conflict.
    pub conflicts: u64,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<CentralStore>) -> Self {
        Self {
            config,
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the session of a device, if it ever connected.
    pub fn session(&self, device_id: &DeviceId) -> Option<DeviceSession> {
        self.sessions.read().get(device_id).cloned()
    }

    fn update_cursor(&self, device_id: &DeviceId, cursor: u64) {
        self.sessions
            .write()
            .entry(device_id.clone())
            .or_default()
            .last_cursor = cursor;
    }

    fn record_push(&self, device_id: &DeviceId, applied: u64, conflicts: u64) {
        let mut sessions = self.sessions.write();
        let session = sessions.entry(device_id.clone()).or_default();
        session.applied += applied;
        session.conflicts += conflicts;
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        if request.limit == 0 {
            return Err(ServerError::InvalidRequest("pull limit must be positive".into()));
        }
        let limit = request.limit.min(self.context.config.max_pull_batch) as usize;

        let (changes, cursor, has_more) =
            self.context
                .store
                .changes_since(&request.device_id, request.since, limit);
        self.context.update_cursor(&request.device_id, cursor);

        tracing::debug!(
            device = %request.device_id,
            since = request.since,
            returned = changes.len(),
            cursor,
            has_more,
            "pull served"
        );
        Ok(PullResponse::new(changes, cursor, has_more))
    }

    /// Handles a push request.
    ///
    /// Every submission must come from the requesting device.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        let max = self.context.config.max_push_batch;
        if request.submissions.len() > max as usize {
            return Err(ServerError::BatchTooLarge {
                size: request.submissions.len(),
                max,
            });
        }
        if let Some(foreign) = request
            .submissions
            .iter()
            .find(|s| s.entry.device_id != request.device_id)
        {
            return Err(ServerError::InvalidRequest(format!(
                "entry {} belongs to device {}",
                foreign.entry.id, foreign.entry.device_id
            )));
        }

        let mut applied = 0;
        let mut conflicts = 0;
        let outcomes: Vec<PushOutcome> = request
            .submissions
            .iter()
            .map(|submission| {
                let result = self.context.store.apply(submission);
                match result {
                    PushResult::Applied { .. } => applied += 1,
                    PushResult::Conflict(_) => conflicts += 1,
                }
                PushOutcome {
                    entry_id: submission.entry.id,
                    result,
                }
            })
            .collect();
        self.context
            .record_push(&request.device_id, applied, conflicts);

        tracing::debug!(
            device = %request.device_id,
            applied,
            conflicts,
            "push served"
        );
        Ok(PushResponse::new(outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ksamati_sync_protocol::{ChangeEntry, NewChange, Submission};
    use serde_json::json;

    fn create_handler(config: ServerConfig) -> (RequestHandler, Arc<HandlerContext>) {
        let context = Arc::new(HandlerContext::new(config, Arc::new(CentralStore::new())));
        (RequestHandler::new(Arc::clone(&context)), context)
    }

    fn create(device: &str, id: &str) -> Submission {
        Submission::normal(ChangeEntry::from_new(
            NewChange::create(DeviceId::new(device), "site", id, json!({"name": id})),
            1,
            Utc::now(),
        ))
    }

    #[test]
    fn pull_empty() {
        let (handler, _) = create_handler(ServerConfig::default());
        let response = handler
            .handle_pull(PullRequest::new(DeviceId::new("a"), 0, 10))
            .unwrap();
        assert!(response.changes.is_empty());
        assert_eq!(response.cursor, 0);
        assert!(!response.has_more);
    }

    #[test]
    fn push_and_pull() {
        let (handler, context) = create_handler(ServerConfig::default());
        let push = PushRequest::new(DeviceId::new("a"), vec![create("a", "S-1"), create("a", "S-2")]);
        let response = handler.handle_push(push).unwrap();
        assert_eq!(response.outcomes.len(), 2);
        assert!(response
            .outcomes
            .iter()
            .all(|o| matches!(o.result, PushResult::Applied { server_version: 1 })));

        let pulled = handler
            .handle_pull(PullRequest::new(DeviceId::new("b"), 0, 10))
            .unwrap();
        assert_eq!(pulled.changes.len(), 2);
        assert_eq!(context.session(&DeviceId::new("b")).unwrap().last_cursor, 2);
        assert_eq!(context.session(&DeviceId::new("a")).unwrap().applied, 2);
    }

    #[test]
    fn pull_pagination_respects_server_limit() {
        let (handler, _) = create_handler(ServerConfig::default().with_max_pull_batch(2));
        let submissions = (0..5).map(|i| create("a", &format!("S-{i}"))).collect();
        handler
            .handle_push(PushRequest::new(DeviceId::new("a"), submissions))
            .unwrap();

        let device = DeviceId::new("b");
        let first = handler
            .handle_pull(PullRequest::new(device.clone(), 0, 50))
            .unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);

        let second = handler
            .handle_pull(PullRequest::new(device.clone(), first.cursor, 50))
            .unwrap();
        assert_eq!(second.changes.len(), 2);
        assert!(second.has_more);

        let last = handler
            .handle_pull(PullRequest::new(device, second.cursor, 50))
            .unwrap();
        assert_eq!(last.changes.len(), 1);
        assert!(!last.has_more);
    }

    #[test]
    fn push_over_limit_rejected() {
        let (handler, _) = create_handler(ServerConfig::default().with_max_push_batch(1));
        let push = PushRequest::new(DeviceId::new("a"), vec![create("a", "S-1"), create("a", "S-2")]);
        assert!(matches!(
            handler.handle_push(push),
            Err(ServerError::BatchTooLarge { size: 2, max: 1 })
        ));
    }

    #[test]
    fn push_of_foreign_entry_rejected() {
        let (handler, _) = create_handler(ServerConfig::default());
        let push = PushRequest::new(DeviceId::new("a"), vec![create("b", "S-1")]);
        assert!(matches!(
            handler.handle_push(push),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn conflicts_counted_per_session() {
        let (handler, context) = create_handler(ServerConfig::default());
        handler
            .handle_push(PushRequest::new(DeviceId::new("a"), vec![create("a", "S-1")]))
            .unwrap();
        let response = handler
            .handle_push(PushRequest::new(DeviceId::new("b"), vec![create("b", "S-1")]))
            .unwrap();

        assert!(matches!(response.outcomes[0].result, PushResult::Conflict(_)));
        assert_eq!(context.session(&DeviceId::new("b")).unwrap().conflicts, 1);
    }

    #[test]
    fn zero_limit_rejected() {
        let (handler, _) = create_handler(ServerConfig::default());
        assert!(handler
            .handle_pull(PullRequest::new(DeviceId::new("a"), 0, 0))
            .is_err());
    }
}
