//! Legacy HTTP+SSE transport
//!
//! The client opens a long-lived event stream and posts messages to a separate
//! endpoint tagged with `?sessionId=`. Replies travel back over the stream.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    task::{Context, Poll},
};

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppError;
use crate::mcp::server::{McpServer, Notifier};
use crate::transport::lifecycle::{Lifecycle, TransportEvent};
use crate::transport::{SSE_ENDPOINT_EVENT, SSE_MESSAGE_EVENT};

pub struct SseTransport {
    session_id: String,
    message_endpoint: String,
    server: OnceLock<Arc<McpServer>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    lifecycle: Lifecycle,
}

/// The response body of an SSE session. Dropping it (client disconnect)
/// closes the transport.
pub struct SseEventStream {
    events: UnboundedReceiverStream<Event>,
    transport: Arc<SseTransport>,
}

impl SseTransport {
    /// Builds the transport and its live event stream. The session ID is
    /// assigned here and announced in the first `endpoint` event.
    pub fn open(message_endpoint: &str) -> (Arc<Self>, SseEventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            session_id: Uuid::new_v4().to_string(),
            message_endpoint: message_endpoint.to_string(),
            server: OnceLock::new(),
            outbound: Mutex::new(Some(sender)),
            lifecycle: Lifecycle::new(),
        });

        let endpoint = transport.endpoint_url();
        transport.send(Event::default().event(SSE_ENDPOINT_EVENT).data(endpoint));

        let stream = SseEventStream {
            events: UnboundedReceiverStream::new(receiver),
            transport: transport.clone(),
        };
        (transport, stream)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}?sessionId={}", self.message_endpoint, self.session_id)
    }

    pub fn connect(&self, server: Arc<McpServer>) -> Result<(), AppError> {
        self.server
            .set(server)
            .map_err(|_| AppError::internal("transport is already connected to a server"))
    }

    pub fn on_close(&self, observer: impl FnOnce(TransportEvent) + Send + 'static) {
        self.lifecycle.subscribe(observer);
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
            self.outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            debug!(session_id = %self.session_id, "sse transport closed");
        }
    }

    /// Dispatches a posted message; any reply is written to the event stream.
    pub async fn handle_post_message(&self, payload: Value) -> Result<(), AppError> {
        let server = self
            .server
            .get()
            .ok_or_else(|| AppError::internal("transport used before connect"))?;

        if let Some(response) = server.handle_payload(payload, Some(self as &dyn Notifier)).await {
            self.send(message_event(&response));
        }
        Ok(())
    }

    fn send(&self, event: Event) {
        let delivered = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|sender| sender.send(event).is_ok());

        if delivered == Some(false) {
            self.fail("event stream receiver is gone");
        }
    }
}

fn message_event(message: &Value) -> Event {
    Event::default()
        .event(SSE_MESSAGE_EVENT)
        .data(message.to_string())
}

impl Notifier for SseTransport {
    fn notify(&self, notification: Value) {
        self.send(message_event(&notification));
    }
}

impl Stream for SseEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx).map(|event| event.map(Ok))
    }
}

impl Drop for SseEventStream {
    fn drop(&mut self) {
        self.transport.close();
    }
}
