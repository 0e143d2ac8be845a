//! Session registries for the networked transports
//!
//! Each manager owns its own registry. The routing layer consults the other
//! manager through [`SessionOwnership`] so an ID is never live on both.

pub mod manager;
pub mod sse_manager;
pub mod store;

/// Read-only view a manager exposes to the other transport's routes.
pub trait SessionOwnership: Send + Sync {
    fn has_session(&self, session_id: &str) -> bool;
}
