//! Main sync server.

use crate::central::CentralStore;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{DeviceSession, HandlerContext, RequestHandler};
use ksamati_sync_protocol::{
    DeviceId, PullRequest, PullResponse, PushRequest, PushResponse, SyncMessage,
};
use std::sync::Arc;

/// The sync server.
///
/// Serves pull and push requests against a [`CentralStore`]. Transports
/// hand it decoded messages through [`handle_message`](Self::handle_message)
/// or raw CBOR frames through [`handle_bytes`](Self::handle_bytes).
///
/// # Example
///
/// ```
/// use ksamati_sync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// assert_eq!(server.feed_len(), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server with an empty central store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(CentralStore::new()))
    }

    /// Creates a sync server over an existing central store.
    pub fn with_store(config: ServerConfig, store: Arc<CentralStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Handles a sync message (dispatches to the appropriate handler).
    pub fn handle_message(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::PullRequest(req) => self.handle_pull(req).map(SyncMessage::PullResponse),
            SyncMessage::PushRequest(req) => self.handle_push(req).map(SyncMessage::PushResponse),
            other => Err(ServerError::UnexpectedMessage(other.type_code())),
        }
    }

    /// Handles an encoded message and returns the encoded reply.
    ///
    /// Failures are answered with [`SyncMessage::Error`].
    pub fn handle_bytes(&self, bytes: &[u8]) -> ServerResult<Vec<u8>> {
        let reply = match SyncMessage::decode(bytes)
            .map_err(ServerError::from)
            .and_then(|message| self.handle_message(message))
        {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "request failed");
                err.to_message()
            }
        };
        Ok(reply.encode()?)
    }

    /// Returns the central store.
    pub fn store(&self) -> &Arc<CentralStore> {
        &self.context.store
    }

    /// Returns the session of a device, if it ever connected.
    pub fn session(&self, device_id: &DeviceId) -> Option<DeviceSession> {
        self.context.session(device_id)
    }

    /// Returns the number of changes in the central feed.
    pub fn feed_len(&self) -> usize {
        self.context.store.feed_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ksamati_sync_protocol::{ChangeEntry, NewChange, PushResult, Submission};
    use serde_json::json;

    fn submission(device: &str, id: &str) -> Submission {
        Submission::normal(ChangeEntry::from_new(
            NewChange::create(DeviceId::new(device), "report", id, json!({"progress": 40})),
            1,
            Utc::now(),
        ))
    }

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.feed_len(), 0);
        assert!(server.session(&DeviceId::new("a")).is_none());
    }

    #[test]
    fn full_sync_flow() {
        let server = SyncServer::new(ServerConfig::default());
        let a = DeviceId::new("a");
        let b = DeviceId::new("b");

        let response = server
            .handle_push(PushRequest::new(a.clone(), vec![submission("a", "R-1")]))
            .unwrap();
        assert_eq!(
            response.outcomes[0].result,
            PushResult::Applied { server_version: 1 }
        );

        let own = server.handle_pull(PullRequest::new(a, 0, 10)).unwrap();
        assert!(own.changes.is_empty());
        assert_eq!(own.cursor, 1);

        let other = server.handle_pull(PullRequest::new(b, 0, 10)).unwrap();
        assert_eq!(other.changes.len(), 1);
    }

    #[test]
    fn message_dispatch() {
        let server = SyncServer::new(ServerConfig::default());
        let message = SyncMessage::PullRequest(PullRequest::new(DeviceId::new("a"), 0, 10));

        let response = server.handle_message(message).unwrap();
        assert!(matches!(response, SyncMessage::PullResponse(_)));

        let stray = SyncMessage::PushResponse(PushResponse::default());
        assert!(matches!(
            server.handle_message(stray),
            Err(ServerError::UnexpectedMessage(4))
        ));
    }

    #[test]
    fn bytes_round_trip() {
        let server = SyncServer::new(ServerConfig::default());
        let request = SyncMessage::PushRequest(PushRequest::new(
            DeviceId::new("a"),
            vec![submission("a", "R-1")],
        ));

        let reply = server.handle_bytes(&request.encode().unwrap()).unwrap();
        match SyncMessage::decode(&reply).unwrap() {
            SyncMessage::PushResponse(response) => assert_eq!(response.outcomes.len(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn garbage_answered_with_error() {
        let server = SyncServer::new(ServerConfig::default());
        let reply = server.handle_bytes(&[0xff, 0x00, 0x13]).unwrap();
        assert!(matches!(
            SyncMessage::decode(&reply).unwrap(),
            SyncMessage::Error { retryable: false, .. }
        ));
    }

    #[test]
    fn shared_store() {
        let store = Arc::new(CentralStore::new());
        let server = SyncServer::with_store(ServerConfig::default(), Arc::clone(&store));
        server
            .handle_push(PushRequest::new(DeviceId::new("a"), vec![submission("a", "R-1")]))
            .unwrap();
        assert_eq!(store.feed_len(), 1);
    }
}
