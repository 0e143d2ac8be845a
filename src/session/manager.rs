//! Session manager for the stateful streamable HTTP transport
//!
//! Owns the `session id -> transport` registry. Sessions are created on a
//! valid `initialize`, resolved on every later request and destroyed on
//! DELETE, on transport close, or by `cleanup` at shutdown.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::mcp::server::McpServer;
use crate::session::store::{SessionRecord, SessionStore};
use crate::session::SessionOwnership;
use crate::transport::lifecycle::TransportEvent;
use crate::transport::streamable::StreamableHttpTransport;

type Registry = DashMap<String, Arc<StreamableHttpTransport>>;

pub struct SessionManager {
    server: Arc<McpServer>,
    sessions: Arc<Registry>,
    store: Option<Arc<dyn SessionStore>>,
}

impl SessionManager {
    pub fn new(server: Arc<McpServer>, store: Option<Arc<dyn SessionStore>>) -> Self {
        Self {
            server,
            sessions: Arc::new(DashMap::new()),
            store,
        }
    }

    pub async fn create_session(
        &self,
    ) -> Result<(Arc<StreamableHttpTransport>, String), AppError> {
        let session_id = self.generate_session_id();
        let transport = self.build_transport(&session_id)?;
        self.sessions.insert(session_id.clone(), transport.clone());
        self.watch_eviction(&transport, &session_id);

        if let Some(store) = &self.store {
            if let Err(err) = store.set(SessionRecord::new(session_id.clone())).await {
                self.sessions.remove(&session_id);
                transport.close();
                return Err(err);
            }
        }

        info!(session_id = %session_id, total = self.sessions.len(), "session created");
        Ok((transport, session_id))
    }

    /// Absence is a normal outcome; store failures are logged and treated as a miss.
    pub async fn get_transport(&self, session_id: &str) -> Option<Arc<StreamableHttpTransport>> {
        if let Some(transport) = self.sessions.get(session_id).map(|entry| entry.value().clone()) {
            return Some(transport);
        }

        let store = self.store.as_ref()?;
        let record = match store.get(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "session store lookup failed");
                return None;
            }
        };

        match self.rehydrate(&record.session_id) {
            Ok(transport) => Some(transport),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to rehydrate session");
                None
            }
        }
    }

    /// Concurrent lookups for the same stored ID share one transport.
    fn rehydrate(&self, session_id: &str) -> Result<Arc<StreamableHttpTransport>, AppError> {
        let transport = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let transport = self.build_transport(session_id)?;
                transport.mark_initialized();
                entry.insert(transport.clone());
                transport
            }
        };

        self.watch_eviction(&transport, session_id);
        info!(session_id = %session_id, "session rehydrated from store");
        Ok(transport)
    }

    pub async fn terminate_session(&self, session_id: &str) {
        if let Some((_, transport)) = self.sessions.remove(session_id) {
            transport.close();
            info!(session_id = %session_id, "session terminated");
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.delete(session_id).await {
                warn!(session_id = %session_id, error = %err, "failed to delete session record");
            }
        }
    }

    pub async fn cleanup(&self) {
        let transports = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        self.sessions.clear();

        for transport in &transports {
            transport.close();
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.cleanup().await {
                warn!(error = %err, "session store cleanup failed");
            }
        }

        info!(closed = transports.len(), "streamable sessions cleaned up");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn generate_session_id(&self) -> String {
        loop {
            let candidate = Uuid::new_v4().to_string();
            if !self.sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn build_transport(&self, session_id: &str) -> Result<Arc<StreamableHttpTransport>, AppError> {
        let supplied = session_id.to_string();
        let transport = Arc::new(StreamableHttpTransport::new(Some(Box::new(move || supplied))));
        transport.connect(self.server.clone())?;
        Ok(transport)
    }

    /// Subscribed after insertion; a transport that already closed is evicted at once.
    fn watch_eviction(&self, transport: &StreamableHttpTransport, session_id: &str) {
        let registry = Arc::downgrade(&self.sessions);
        let store = self.store.clone();
        let evicted = session_id.to_string();
        transport.on_close(move |event| {
            if let TransportEvent::Errored(reason) = &event {
                warn!(session_id = %evicted, reason = %reason, "session transport errored");
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(&evicted);
            }
            if let (Some(store), Ok(runtime)) = (store, tokio::runtime::Handle::try_current()) {
                runtime.spawn(async move {
                    if let Err(err) = store.delete(&evicted).await {
                        debug!(session_id = %evicted, error = %err, "session record eviction failed");
                    }
                });
            }
        });
    }
}

impl SessionOwnership for SessionManager {
    fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}
