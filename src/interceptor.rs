//! Rewrites file references in `tools/call` arguments before dispatch
//!
//! Networked clients often send paths from their own sandbox
//! (`/mnt/user-data/...`) or from the server's disk. Those are replaced with
//! URLs the media provider can fetch. Handlers call [`rewrite_payload`] only
//! after the request's session has been validated, so a rejected request
//! never consumes a staged upload.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::domain::utils::{classify_source, SourceKind};
use crate::mcp::rpc::{json_rpc_error_with_data, INVALID_PARAMS};
use crate::storage::{content_type_for, sanitize_file_name, ObjectStorage};

pub const PATH_FIELDS: [&str; 10] = [
    "source",
    "source1",
    "source2",
    "filePath",
    "imagePath",
    "image",
    "inputImage",
    "referenceImage",
    "video",
    "audio",
];

const INLINE_PAYLOAD_FIELDS: [&str; 2] = ["base64", "fileData"];

pub const MAX_INTERCEPTED_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct InterceptorState {
    pub upload_dir: Arc<Path>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
}

impl InterceptorState {
    pub fn new(upload_dir: impl Into<PathBuf>, storage: Option<Arc<dyn ObjectStorage>>) -> Self {
        Self {
            upload_dir: Arc::from(upload_dir.into()),
            storage,
        }
    }
}

/// A virtual path that neither a staged file nor an inline payload can satisfy.
#[derive(Debug)]
pub struct UnresolvedVirtualPath {
    pub id: Option<Value>,
    pub field: &'static str,
    pub path: String,
}

impl IntoResponse for UnresolvedVirtualPath {
    fn into_response(self) -> Response {
        let data = json!({
            "field": self.field,
            "path": self.path,
            "suggestions": [
                "Upload the file using the /mcp/upload endpoint first",
                "Provide a public URL (https://...) instead of a local path",
                "Send the content inline as a base64 data URI (data:<mime>;base64,...)",
                "Use the stdio transport, which can read local files directly",
            ],
        });
        let message = format!(
            "File not accessible via HTTP transport: {}. Local sandbox paths cannot be read by the server.",
            self.path
        );

        (
            StatusCode::BAD_REQUEST,
            Json(json_rpc_error_with_data(self.id, INVALID_PARAMS, &message, Some(data))),
        )
            .into_response()
    }
}

/// Rewrites a single message or every message of a batch. Returns whether
/// anything changed; the first unresolvable virtual path aborts the request.
pub async fn rewrite_payload(
    state: &InterceptorState,
    payload: &mut Value,
) -> Result<bool, UnresolvedVirtualPath> {
    match payload {
        Value::Array(batch) => {
            let mut changed = false;
            for message in batch.iter_mut() {
                changed |= rewrite_message(state, message).await?;
            }
            Ok(changed)
        }
        message => rewrite_message(state, message).await,
    }
}

/// Returns whether any argument was replaced.
async fn rewrite_message(
    state: &InterceptorState,
    message: &mut Value,
) -> Result<bool, UnresolvedVirtualPath> {
    if message.get("method").and_then(Value::as_str) != Some("tools/call") {
        return Ok(false);
    }

    let id = message.get("id").cloned();
    let Some(arguments) = message
        .pointer_mut("/params/arguments")
        .and_then(Value::as_object_mut)
    else {
        return Ok(false);
    };

    let inline_payload = INLINE_PAYLOAD_FIELDS.iter().find_map(|field| {
        arguments
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    });

    let mut changed = false;
    for field in PATH_FIELDS {
        let Some(original) = arguments.get(field).and_then(Value::as_str).map(str::to_string) else {
            continue;
        };

        let replacement = match classify_source(&original) {
            SourceKind::Url | SourceKind::DataUri => None,
            SourceKind::VirtualPath => {
                match (resolve_virtual_path(state, &original).await, inline_payload.as_deref()) {
                    (Some(url), _) => Some(url),
                    (None, Some(payload)) => {
                        debug!(field, path = %original, "virtual path replaced by inline payload");
                        Some(inline_data_uri(&original, payload))
                    }
                    (None, None) => {
                        warn!(field, path = %original, "virtual path has no staged file");
                        return Err(UnresolvedVirtualPath {
                            id,
                            field,
                            path: original,
                        });
                    }
                }
            }
            SourceKind::LocalPath => upload_local_file(state, &original).await,
        };

        if let Some(url) = replacement {
            set_argument(arguments, field, url);
            changed = true;
        }
    }

    Ok(changed)
}

/// Payloads that are already data URIs pass through; bare base64 is typed by
/// the virtual path's extension.
fn inline_data_uri(path: &str, payload: &str) -> String {
    if payload.starts_with("data:") {
        return payload.to_string();
    }
    format!("data:{};base64,{payload}", content_type_for(path))
}

fn set_argument(arguments: &mut Map<String, Value>, field: &str, value: String) {
    arguments.insert(field.to_string(), Value::String(value));
}

async fn resolve_virtual_path(state: &InterceptorState, path: &str) -> Option<String> {
    let file_name = sanitize_file_name(path);
    let staged = state.upload_dir.join(&file_name);
    let bytes = tokio::fs::read(&staged).await.ok()?;
    let content_type = content_type_for(&file_name);

    let resolved = match &state.storage {
        Some(storage) => match storage.upload(&file_name, bytes, content_type).await {
            Ok(url) => url,
            Err(err) => {
                warn!(path, error = %err, "failed to upload staged file");
                return None;
            }
        },
        None => format!("data:{content_type};base64,{}", STANDARD.encode(&bytes)),
    };

    if let Err(err) = tokio::fs::remove_file(&staged).await {
        debug!(path = %staged.display(), error = %err, "failed to remove staged file");
    }
    info!(path, file_name = %file_name, "virtual path resolved from staged upload");
    Some(resolved)
}

/// Best effort: anything that cannot be read or stored is left as is.
async fn upload_local_file(state: &InterceptorState, path: &str) -> Option<String> {
    let storage = state.storage.as_ref()?;
    let bytes = tokio::fs::read(path).await.ok()?;

    match storage
        .upload(&sanitize_file_name(path), bytes, content_type_for(path))
        .await
    {
        Ok(url) => {
            info!(path, "local file uploaded for http client");
            Some(url)
        }
        Err(err) => {
            warn!(path, error = %err, "local file upload failed");
            None
        }
    }
}
