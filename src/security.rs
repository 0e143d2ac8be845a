//! Request guards for the networked transports
//!
//! Applied in order DNS-rebinding check, rate limit, bearer token. Each guard
//! short-circuits with a JSON-RPC error envelope.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::config::SecurityConfig;
use crate::errors::AppError;

/// Pluggable admission hook. `Err` carries the message returned to the client.
pub trait RateLimitPolicy: Send + Sync {
    fn check(&self, request: &Request) -> Result<(), String>;
}

#[derive(Clone)]
pub struct SecurityState {
    pub dns_rebinding_protection: bool,
    pub allowed_hosts: Arc<[String]>,
    pub secret: Option<Arc<str>>,
    pub rate_limiter: Option<Arc<dyn RateLimitPolicy>>,
}

impl SecurityState {
    pub fn new(config: &SecurityConfig, rate_limiter: Option<Arc<dyn RateLimitPolicy>>) -> Self {
        Self {
            dns_rebinding_protection: config.dns_rebinding_protection,
            allowed_hosts: config
                .allowed_hosts
                .iter()
                .map(|host| host.to_ascii_lowercase())
                .collect(),
            secret: config.secret.as_deref().map(Arc::from),
            rate_limiter,
        }
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        let host = host_without_port(host).to_ascii_lowercase();
        self.allowed_hosts.iter().any(|allowed| *allowed == host)
    }
}

pub async fn enforce_dns_rebinding_protection(
    State(state): State<SecurityState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.dns_rebinding_protection {
        return Ok(next.run(request).await);
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|authority| authority.to_string()));

    match host {
        Some(host) if state.is_allowed_host(&host) => Ok(next.run(request).await),
        Some(host) => Err(AppError::forbidden(
            "host_not_allowed",
            format!("Invalid Host header: {host}"),
        )),
        None => Err(AppError::forbidden("host_missing", "Missing Host header")),
    }
}

pub async fn enforce_rate_limit(
    State(state): State<SecurityState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(policy) = &state.rate_limiter {
        policy.check(&request).map_err(AppError::rate_limited)?;
    }

    Ok(next.run(request).await)
}

pub async fn require_bearer_token(
    State(state): State<SecurityState>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(secret) = state.secret.as_deref() else {
        return Ok(next.run(request).await);
    };

    let Some(TypedHeader(auth)) = auth_header else {
        return Err(AppError::unauthorized(
            "missing_token",
            "missing authorization header",
        ));
    };

    if !constant_time_eq(auth.token().as_bytes(), secret.as_bytes()) {
        return Err(AppError::unauthorized(
            "invalid_token",
            "invalid bearer token",
        ));
    }

    Ok(next.run(request).await)
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Strips the port, and the brackets of an IPv6 literal.
fn host_without_port(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|ch| ch.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
