//! Streamable HTTP transport
//!
//! One instance per stateful session (or per request in stateless mode).
//! POST bodies are dispatched to the connected `McpServer`; server-initiated
//! notifications fan out to every open GET stream of the session.

use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    time::Duration,
};

use axum::{
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::debug;

use crate::errors::AppError;
use crate::mcp::server::{is_initialize_request, McpServer, Notifier};
use crate::transport::lifecycle::{Lifecycle, TransportEvent};
use crate::transport::{MCP_SESSION_ID_HEADER, SSE_KEEP_ALIVE_SECS, SSE_MESSAGE_EVENT};

const NOTIFICATION_BUFFER: usize = 100;

/// Supplies the session ID once, at construction.
pub type SessionIdGenerator = Box<dyn FnOnce() -> String + Send>;

pub struct StreamableHttpTransport {
    session_id: Option<String>,
    server: OnceLock<Arc<McpServer>>,
    initialized: AtomicBool,
    notifications: Mutex<Option<broadcast::Sender<String>>>,
    lifecycle: Lifecycle,
}

impl StreamableHttpTransport {
    /// `None` builds a stateless transport that never issues a session ID.
    pub fn new(session_id_generator: Option<SessionIdGenerator>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            session_id: session_id_generator.map(|generate| generate()),
            server: OnceLock::new(),
            initialized: AtomicBool::new(false),
            notifications: Mutex::new(Some(notifications)),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn connect(&self, server: Arc<McpServer>) -> Result<(), AppError> {
        self.server
            .set(server)
            .map_err(|_| AppError::internal("transport is already connected to a server"))
    }

    pub fn on_close(&self, observer: impl FnOnce(TransportEvent) + Send + 'static) {
        self.lifecycle.subscribe(observer);
    }

    /// Marks a session restored from a store as past its `initialize` handshake.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_finished()
    }

    pub fn close(&self) {
        self.finish(TransportEvent::Closed);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.finish(TransportEvent::Errored(reason.into()));
    }

    fn finish(&self, event: TransportEvent) {
        if self.lifecycle.finish(event) {
            // Dropping the sender ends every open notification stream.
            self.notifications
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            debug!(session_id = ?self.session_id, "streamable transport closed");
        }
    }

    pub async fn handle_post(&self, payload: Value) -> Result<Response, AppError> {
        if self.is_closed() {
            return Err(AppError::bad_request(
                "session_closed",
                "Bad Request: Session has been terminated",
            ));
        }

        let server = self
            .server
            .get()
            .ok_or_else(|| AppError::internal("transport used before connect"))?;

        if self.session_id.is_some()
            && is_initialize_request(&payload)
            && self.initialized.swap(true, Ordering::AcqRel)
        {
            return Err(AppError::bad_request(
                "already_initialized",
                "Invalid Request: Server already initialized",
            ));
        }

        let mut response = match server.handle_payload(payload, Some(self as &dyn Notifier)).await {
            Some(body) => (StatusCode::OK, Json(body)).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        };
        self.attach_session_header(&mut response)?;
        Ok(response)
    }

    /// Opens the GET stream carrying server-initiated notifications.
    pub fn open_notification_stream(&self) -> Result<Response, AppError> {
        let receiver = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| {
                AppError::bad_request("session_closed", "Bad Request: Session has been terminated")
            })?;

        let stream = BroadcastStream::new(receiver).filter_map(|message| {
            message
                .ok()
                .map(|data| Ok::<_, Infallible>(Event::default().event(SSE_MESSAGE_EVENT).data(data)))
        });

        let mut response = Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(SSE_KEEP_ALIVE_SECS)))
            .into_response();
        self.attach_session_header(&mut response)?;
        Ok(response)
    }

    fn attach_session_header(&self, response: &mut Response) -> Result<(), AppError> {
        if let Some(session_id) = self.session_id.as_deref() {
            let value = HeaderValue::from_str(session_id)
                .map_err(|err| AppError::internal(format!("invalid session id header: {err}")))?;
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
        Ok(())
    }
}

impl Notifier for StreamableHttpTransport {
    fn notify(&self, notification: Value) {
        if let Some(sender) = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            // No open GET stream is not an error; the notification is dropped.
            let _ = sender.send(notification.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::domain::provider::UnconfiguredProvider;

    fn connected(session_id: Option<&str>) -> StreamableHttpTransport {
        let generator = session_id.map(|id| {
            let id = id.to_string();
            Box::new(move || id) as SessionIdGenerator
        });
        let transport = StreamableHttpTransport::new(generator);
        transport
            .connect(Arc::new(McpServer::new(Arc::new(UnconfiguredProvider::new()))))
            .expect("connect");
        transport
    }

    fn initialize_body() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }
        })
    }

    #[test]
    fn session_id_is_fixed_at_construction() {
        let transport = connected(Some("abc-123"));
        assert_eq!(transport.session_id(), Some("abc-123"));
        assert_eq!(connected(None).session_id(), None);
    }

    #[test]
    fn second_connect_fails() {
        let transport = connected(None);
        let result =
            transport.connect(Arc::new(McpServer::new(Arc::new(UnconfiguredProvider::new()))));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stateful_response_carries_session_header() {
        let transport = connected(Some("abc-123"));
        let response = transport
            .handle_post(initialize_body())
            .await
            .expect("initialize response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(MCP_SESSION_ID_HEADER),
            Some(&HeaderValue::from_static("abc-123"))
        );
    }

    #[tokio::test]
    async fn rejects_second_initialize_on_session() {
        let transport = connected(Some("abc-123"));
        transport
            .handle_post(initialize_body())
            .await
            .expect("first initialize");

        let error = transport
            .handle_post(initialize_body())
            .await
            .expect_err("second initialize must fail");
        assert!(error.to_string().contains("already initialized"));
    }

    #[tokio::test]
    async fn notification_only_body_is_accepted() {
        let transport = connected(None);
        let response = transport
            .handle_post(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .expect("notification response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().get(MCP_SESSION_ID_HEADER).is_none());
    }

    #[tokio::test]
    async fn closed_transport_rejects_requests_and_streams() {
        let transport = connected(Some("abc-123"));
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        transport.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.close();
        transport.fail("late error");

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(transport.handle_post(initialize_body()).await.is_err());
        assert!(transport.open_notification_stream().is_err());
    }
}
