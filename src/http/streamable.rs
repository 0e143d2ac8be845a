//! Streamable HTTP routes on `/mcp`
//!
//! Stateless mode builds a throwaway transport per POST. Stateful mode routes
//! by the `Mcp-Session-Id` header, creating a session only for `initialize`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::AppError;
use crate::http::session_id_from_headers;
use crate::interceptor::{rewrite_payload, InterceptorState, MAX_INTERCEPTED_BODY_BYTES};
use crate::mcp::rpc::{json_rpc_error, PARSE_ERROR};
use crate::mcp::server::{is_initialize_request, McpServer};
use crate::session::manager::SessionManager;
use crate::session::SessionOwnership;
use crate::transport::streamable::StreamableHttpTransport;

pub const MCP_PATH: &str = "/mcp";

const STATELESS_NOT_ALLOWED: &str = "Method not allowed in stateless mode";
const SSE_OWNED_SESSION: &str = "Bad Request: Session ID already in use by SSE transport";
const NO_VALID_SESSION: &str = "Bad Request: No valid session ID provided";

#[derive(Clone)]
pub struct StreamableState {
    pub config: Arc<Config>,
    pub server: Arc<McpServer>,
    pub sessions: Arc<SessionManager>,
    /// Sessions owned by the legacy SSE transport.
    pub sse_sessions: Arc<dyn SessionOwnership>,
    pub interceptor: InterceptorState,
}

pub fn router(state: StreamableState) -> Router {
    Router::new()
        .route(
            MCP_PATH,
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .layer(DefaultBodyLimit::max(MAX_INTERCEPTED_BODY_BYTES))
        .with_state(state)
}

pub async fn handle_post(
    State(state): State<StreamableState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let mut payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json_rpc_error(None, PARSE_ERROR, "Parse error")),
            )
                .into_response())
        }
    };

    if !state.config.is_stateful() {
        if let Err(unresolved) = rewrite_payload(&state.interceptor, &mut payload).await {
            return Ok(unresolved.into_response());
        }
        return handle_stateless_post(&state, payload).await;
    }

    let session_id = session_id_from_headers(&headers);
    if let Some(session_id) = session_id.as_deref() {
        if state.sse_sessions.has_session(session_id) {
            return Err(AppError::bad_request("session_in_use", SSE_OWNED_SESSION));
        }
    }

    let existing = match session_id.as_deref() {
        Some(session_id) => state.sessions.get_transport(session_id).await,
        None => None,
    };

    if existing.is_none() && !is_initialize_request(&payload) {
        debug!(session_id = ?session_id, "rejecting request without a resolvable session");
        return Err(AppError::bad_request("missing_session", NO_VALID_SESSION));
    }

    if let Err(unresolved) = rewrite_payload(&state.interceptor, &mut payload).await {
        return Ok(unresolved.into_response());
    }

    if let Some(transport) = existing {
        return transport.handle_post(payload).await;
    }

    let (transport, session_id) = state.sessions.create_session().await?;
    match transport.handle_post(payload).await {
        Ok(response) => Ok(response),
        Err(err) => {
            state.sessions.terminate_session(&session_id).await;
            Err(err)
        }
    }
}

/// The transport is closed as soon as the response is produced; nothing is
/// retained if the client drops the connection.
async fn handle_stateless_post(
    state: &StreamableState,
    payload: Value,
) -> Result<Response, AppError> {
    let transport = StreamableHttpTransport::new(None);
    transport.connect(state.server.clone())?;
    let response = transport.handle_post(payload).await;
    transport.close();
    response
}

pub async fn handle_get(
    State(state): State<StreamableState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !state.config.is_stateful() {
        return Err(AppError::method_not_allowed(STATELESS_NOT_ALLOWED));
    }

    let session_id = session_id_from_headers(&headers)
        .ok_or_else(|| AppError::bad_request("missing_session", NO_VALID_SESSION))?;
    if state.sse_sessions.has_session(&session_id) {
        return Err(AppError::bad_request("session_in_use", SSE_OWNED_SESSION));
    }

    let transport = state
        .sessions
        .get_transport(&session_id)
        .await
        .ok_or_else(|| AppError::bad_request("missing_session", NO_VALID_SESSION))?;

    info!(session_id = %session_id, "notification stream opened");
    transport.open_notification_stream()
}

pub async fn handle_delete(
    State(state): State<StreamableState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    if !state.config.is_stateful() {
        return Err(AppError::method_not_allowed(STATELESS_NOT_ALLOWED));
    }

    if let Some(session_id) = session_id_from_headers(&headers) {
        state.sessions.terminate_session(&session_id).await;
    }
    Ok(StatusCode::NO_CONTENT)
}
