//! CBOR transport over a pluggable request client.
//!
//! The actual network stack is abstracted by [`RequestClient`], so any
//! library (or an in-process loopback) can carry the encoded messages.

use crate::error::{SyncError, SyncResult};
use crate::transport::RemoteStore;
use async_trait::async_trait;
use ksamati_sync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse, SyncMessage};
use parking_lot::RwLock;

/// Carries one encoded request to the central store and returns the
/// encoded reply.
#[async_trait]
pub trait RequestClient: Send + Sync {
    /// Sends a request body and returns the response body.
    async fn send(&self, body: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// Remote store speaking CBOR-encoded [`SyncMessage`]s.
pub struct CborTransport<C: RequestClient> {
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: RequestClient> CborTransport<C> {
    /// Creates a transport over a client.
    pub fn new(client: C) -> Self {
        Self {
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn exchange(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        let body = request
            .encode()
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let reply = match self.client.send(body).await {
            Ok(reply) => {
                *self.last_error.write() = None;
                reply
            }
            Err(e) => {
                *self.last_error.write() = Some(e.clone());
                return Err(SyncError::transport_retryable(e));
            }
        };

        match SyncMessage::decode(&reply)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))?
        {
            SyncMessage::Error { message, retryable } if retryable => {
                Err(SyncError::ServerError(message))
            }
            SyncMessage::Error { message, .. } => Err(SyncError::Rejected(message)),
            message => Ok(message),
        }
    }
}

#[async_trait]
impl<C: RequestClient> RemoteStore for CborTransport<C> {
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        match self
            .exchange(SyncMessage::PullRequest(request.clone()))
            .await?
        {
            SyncMessage::PullResponse(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        match self
            .exchange(SyncMessage::PushRequest(request.clone()))
            .await?
        {
            SyncMessage::PushResponse(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(message: &SyncMessage) -> SyncError {
    SyncError::Protocol(format!("unexpected reply type {}", message.type_code()))
}

/// Handles encoded requests in process.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request body and returns the response body.
    fn handle_request(&self, body: &[u8]) -> Result<Vec<u8>, String>;
}

impl<F> LoopbackServer for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync,
{
    fn handle_request(&self, body: &[u8]) -> Result<Vec<u8>, String> {
        self(body)
    }
}

/// A request client that routes requests directly to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client for a server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> RequestClient for LoopbackClient<S> {
    async fn send(&self, body: Vec<u8>) -> Result<Vec<u8>, String> {
        self.server.handle_request(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ksamati_sync_protocol::{ChangeEntry, DeviceId, NewChange, PushResult, Submission};
    use ksamati_sync_server::{ServerConfig, SyncServer};
    use serde_json::json;
    use std::sync::Arc;

    struct FailingClient;

    #[async_trait]
    impl RequestClient for FailingClient {
        async fn send(&self, _body: Vec<u8>) -> Result<Vec<u8>, String> {
            Err("connection refused".into())
        }
    }

    struct CannedClient(Vec<u8>);

    #[async_trait]
    impl RequestClient for CannedClient {
        async fn send(&self, _body: Vec<u8>) -> Result<Vec<u8>, String> {
            Ok(self.0.clone())
        }
    }

    fn loopback(server: Arc<SyncServer>) -> CborTransport<impl RequestClient> {
        CborTransport::new(LoopbackClient::new(move |body: &[u8]| {
            server.handle_bytes(body).map_err(|e| e.to_string())
        }))
    }

    #[tokio::test]
    async fn push_and_pull_through_server() {
        let server = Arc::new(SyncServer::new(ServerConfig::default()));
        let transport = loopback(Arc::clone(&server));
        let entry = ChangeEntry::from_new(
            NewChange::create(DeviceId::new("a"), "contract", "C-1", json!({"title": "Bridge"})),
            1,
            Utc::now(),
        );

        let response = transport
            .push(&PushRequest::new(
                DeviceId::new("a"),
                vec![Submission::normal(entry)],
            ))
            .await
            .unwrap();
        assert_eq!(
            response.outcomes[0].result,
            PushResult::Applied { server_version: 1 }
        );

        let page = transport
            .pull(&PullRequest::new(DeviceId::new("b"), 0, 10))
            .await
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(server.feed_len(), 1);
    }

    #[tokio::test]
    async fn client_failure_is_retryable() {
        let transport = CborTransport::new(FailingClient);
        let err = transport
            .pull(&PullRequest::new(DeviceId::new("a"), 0, 10))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.last_error().as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn server_rejection_is_not_retryable() {
        let server = Arc::new(SyncServer::new(ServerConfig::default().with_max_push_batch(0)));
        let transport = loopback(server);
        let entry = ChangeEntry::from_new(
            NewChange::create(DeviceId::new("a"), "contract", "C-1", json!({})),
            1,
            Utc::now(),
        );

        let err = transport
            .push(&PushRequest::new(
                DeviceId::new("a"),
                vec![Submission::normal(entry)],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn wrong_reply_type_is_protocol_error() {
        let reply = SyncMessage::PushResponse(PushResponse::default())
            .encode()
            .unwrap();
        let transport = CborTransport::new(CannedClient(reply));
        let err = transport
            .pull(&PullRequest::new(DeviceId::new("a"), 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
