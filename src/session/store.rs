//! Pluggable persistence for stateful session metadata.
//!
//! The in-memory map of the `SessionManager` always wins; a store is only
//! consulted on a cache miss, which lets another process rehydrate a session
//! it did not create.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, AppError>;
    async fn set(&self, record: SessionRecord) -> Result<(), AppError>;
    async fn delete(&self, session_id: &str) -> Result<(), AppError>;
    async fn cleanup(&self) -> Result<(), AppError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    records: DashMap<String, SessionRecord>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, AppError> {
        Ok(self
            .records
            .get(session_id)
            .map(|record| record.value().clone()))
    }

    async fn set(&self, record: SessionRecord) -> Result<(), AppError> {
        self.records.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), AppError> {
        self.records.remove(session_id);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), AppError> {
        self.records.clear();
        Ok(())
    }
}
