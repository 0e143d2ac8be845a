//! Legacy HTTP+SSE routes
//!
//! GET on the stream path opens a session; POST on the message path feeds it.
//! Replies travel over the stream, so the POST only acknowledges with 202.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{sse::KeepAlive, IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::errors::AppError;
use crate::interceptor::{rewrite_payload, InterceptorState, MAX_INTERCEPTED_BODY_BYTES};
use crate::mcp::rpc::{json_rpc_error, PARSE_ERROR};
use crate::session::sse_manager::SseSessionManager;
use crate::session::SessionOwnership;
use crate::transport::SSE_KEEP_ALIVE_SECS;

const STATELESS_NOT_ALLOWED: &str = "SSE transport is not available in stateless mode";

#[derive(Clone)]
pub struct SseState {
    pub config: Arc<Config>,
    pub sessions: Arc<SseSessionManager>,
    /// Sessions owned by the streamable HTTP transport.
    pub streamable_sessions: Arc<dyn SessionOwnership>,
    pub interceptor: InterceptorState,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub fn router(state: SseState) -> Router {
    let stream_path = state.config.sse.stream_path.clone();
    let message_path = state.config.sse.message_path.clone();

    Router::new()
        .route(&stream_path, get(open_stream))
        .route(&message_path, post(post_message))
        .layer(DefaultBodyLimit::max(MAX_INTERCEPTED_BODY_BYTES))
        .with_state(state)
}

pub async fn open_stream(State(state): State<SseState>) -> Result<Response, AppError> {
    if !state.config.is_stateful() {
        return Err(AppError::method_not_allowed(STATELESS_NOT_ALLOWED));
    }

    let (_, stream) = state
        .sessions
        .create_session(&state.config.sse.message_path)?;

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(SSE_KEEP_ALIVE_SECS)))
        .into_response())
}

pub async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    if !state.config.is_stateful() {
        return Err(AppError::method_not_allowed(STATELESS_NOT_ALLOWED));
    }

    let session_id = query
        .session_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::bad_request("missing_session_id", "Missing sessionId parameter"))?;

    if state.streamable_sessions.has_session(&session_id) {
        return Err(AppError::bad_request(
            "session_in_use",
            "Session ID already in use by streamable HTTP transport",
        ));
    }

    let transport = state.sessions.get_session(&session_id).ok_or_else(|| {
        AppError::bad_request(
            "unknown_session",
            format!("No active SSE session found for sessionId: {session_id}"),
        )
    })?;

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

    // Path errors are answered on the POST itself; only dispatch goes to the stream.
    if let Err(unresolved) = rewrite_payload(&state.interceptor, &mut payload).await {
        return Ok(unresolved.into_response());
    }

    tokio::spawn(async move {
        if let Err(err) = transport.handle_post_message(payload).await {
            warn!(session_id = %transport.session_id(), error = %err, "sse message dispatch failed");
        }
    });

    Ok(StatusCode::ACCEPTED.into_response())
}
