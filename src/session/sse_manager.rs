use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::mcp::server::McpServer;
use crate::session::SessionOwnership;
use crate::transport::lifecycle::TransportEvent;
use crate::transport::sse::{SseEventStream, SseTransport};

/// Registry of legacy SSE sessions, keyed by the ID each transport assigns itself.
pub struct SseSessionManager {
    server: Arc<McpServer>,
    sessions: Arc<DashMap<String, Arc<SseTransport>>>,
}

impl SseSessionManager {
    pub fn new(server: Arc<McpServer>) -> Self {
        Self {
            server,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn create_session(
        &self,
        message_endpoint: &str,
    ) -> Result<(Arc<SseTransport>, SseEventStream), AppError> {
        let (transport, stream) = SseTransport::open(message_endpoint);
        let session_id = transport.session_id().to_string();

        let registry = Arc::downgrade(&self.sessions);
        let evicted = session_id.clone();
        transport.on_close(move |event| {
            if let TransportEvent::Errored(reason) = &event {
                warn!(session_id = %evicted, reason = %reason, "sse transport errored");
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(&evicted);
            }
        });

        transport.connect(self.server.clone())?;
        self.sessions.insert(session_id.clone(), transport.clone());

        info!(session_id = %session_id, total = self.sessions.len(), "sse session created");
        Ok((transport, stream))
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<SseTransport>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn cleanup(&self) {
        let transports = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        self.sessions.clear();

        for transport in &transports {
            transport.close();
        }

        info!(closed = transports.len(), "sse sessions cleaned up");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl SessionOwnership for SseSessionManager {
    fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}
