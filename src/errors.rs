use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;

use crate::mcp::rpc::{
    json_rpc_error_with_data, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, RATE_LIMITED,
    SERVER_ERROR, UNAUTHORIZED,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest { code: &'static str, message: String },
    #[error("invalid params: {message}")]
    InvalidParams {
        code: &'static str,
        message: String,
        data: Option<Value>,
    },
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
    #[error("forbidden: {message}")]
    Forbidden { code: &'static str, message: String },
    #[error("method not allowed: {message}")]
    MethodNotAllowed { message: &'static str },
    #[error("rate limited: {message}")]
    RateLimited { message: String },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
    #[error("not implemented: {message}")]
    NotImplemented {
        code: &'static str,
        message: &'static str,
    },
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(
        code: &'static str,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self::InvalidParams {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_allowed(message: &'static str) -> Self {
        Self::MethodNotAllowed { message }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }

    pub fn not_implemented(code: &'static str, message: &'static str) -> Self {
        Self::NotImplemented { code, message }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } | Self::InvalidParams { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message, data) = match self {
            Self::BadRequest { message, .. } => (INVALID_REQUEST, message, None),
            Self::InvalidParams { message, data, .. } => (INVALID_PARAMS, message, data),
            Self::Unauthorized { message, .. } => {
                (UNAUTHORIZED, format!("Unauthorized: {message}"), None)
            }
            Self::Forbidden { message, .. } => (UNAUTHORIZED, format!("Forbidden: {message}"), None),
            Self::MethodNotAllowed { message } => (SERVER_ERROR, message.to_string(), None),
            Self::RateLimited { message } => (RATE_LIMITED, message, None),
            Self::Internal { message, .. } => {
                tracing::error!(error = %message, "request failed with internal error");
                (INTERNAL_ERROR, "Internal error".to_string(), None)
            }
            Self::NotImplemented { message, .. } => (INTERNAL_ERROR, message.to_string(), None),
        };

        (status, Json(json_rpc_error_with_data(None, code, &message, data))).into_response()
    }
}
