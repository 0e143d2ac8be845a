//! Health and upload endpoints

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::errors::AppError;
use crate::storage::sanitize_file_name;

pub const UPLOAD_PATH: &str = "/mcp/upload";
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Where a staged upload is visible to the file interceptor.
const VIRTUAL_UPLOAD_ROOT: &str = "/mnt/user-data";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub transport: &'static str,
    pub session_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_fallback: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_paths: Option<SsePaths>,
}

#[derive(Debug, Serialize)]
pub struct SsePaths {
    pub stream: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub file_name: String,
    pub path: String,
    pub size: usize,
}

pub fn health_router(config: Arc<Config>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(config)
}

pub fn upload_router(config: Arc<Config>) -> Router {
    Router::new()
        .route(UPLOAD_PATH, post(upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(config)
}

pub async fn health(State(config): State<Arc<Config>>) -> Json<HealthResponse> {
    let sse_available = config.is_stateful();
    let sse_enabled = sse_available && config.sse.enabled;

    Json(HealthResponse {
        status: "healthy",
        transport: config.transport.as_str(),
        session_mode: config.session_mode.as_str(),
        sse_fallback: sse_available.then_some(if sse_enabled { "enabled" } else { "disabled" }),
        sse_paths: sse_enabled.then(|| SsePaths {
            stream: config.sse.stream_path.clone(),
            message: config.sse.message_path.clone(),
        }),
    })
}

/// Stages the raw request body so a later `/mnt/user-data/<name>` reference resolves.
pub async fn upload(
    State(config): State<Arc<Config>>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let requested = query
        .filename
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("missing_filename", "Missing filename parameter"))?;
    if body.is_empty() {
        return Err(AppError::bad_request(
            "empty_upload",
            "Upload body must not be empty",
        ));
    }

    let file_name = sanitize_file_name(&requested);
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .map_err(|err| AppError::internal(format!("failed to create upload dir: {err}")))?;
    tokio::fs::write(config.upload_dir.join(&file_name), &body)
        .await
        .map_err(|err| AppError::internal(format!("failed to stage upload: {err}")))?;

    info!(file_name = %file_name, size = body.len(), "file staged");
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            success: true,
            path: format!("{VIRTUAL_UPLOAD_ROOT}/{file_name}"),
            file_name,
            size: body.len(),
        }),
    ))
}
