//! HTTP routes of the networked transports
//!
//! `streamable` serves `/mcp`, `sse` serves the legacy stream and message
//! endpoints, `handlers` holds health and upload.

use axum::http::HeaderMap;

use crate::transport::MCP_SESSION_ID_HEADER;

pub mod handlers;
pub mod sse;
pub mod streamable;

/// Reads the `Mcp-Session-Id` request header; blank values count as absent.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
