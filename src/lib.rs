use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware, Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
};

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod interceptor;
pub mod logging;
pub mod mcp;
pub mod security;
pub mod session;
pub mod storage;
pub mod transport;

use config::Config;
use interceptor::InterceptorState;
use mcp::server::McpServer;
use security::{RateLimitPolicy, SecurityState};
use session::{manager::SessionManager, sse_manager::SseSessionManager, store::SessionStore};
use storage::{LocalDirectoryStorage, ObjectStorage};
use transport::MCP_SESSION_ID_HEADER;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub server: Arc<McpServer>,
    pub sessions: Arc<SessionManager>,
    pub sse_sessions: Arc<SseSessionManager>,
    pub rate_limiter: Option<Arc<dyn RateLimitPolicy>>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
}

impl AppState {
    pub fn new(config: Config, server: Arc<McpServer>) -> Self {
        let storage = config.storage_dir.as_ref().map(|dir| {
            Arc::new(LocalDirectoryStorage::new(
                dir.clone(),
                config.storage_public_url.clone(),
            )) as Arc<dyn ObjectStorage>
        });

        Self {
            sessions: Arc::new(SessionManager::new(server.clone(), None)),
            sse_sessions: Arc::new(SseSessionManager::new(server.clone())),
            config: Arc::new(config),
            server,
            rate_limiter: None,
            storage,
        }
    }

    /// Replaces the session manager with one backed by `store`.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Arc::new(SessionManager::new(self.server.clone(), Some(store)));
        self
    }

    pub fn with_rate_limiter(mut self, policy: Arc<dyn RateLimitPolicy>) -> Self {
        self.rate_limiter = Some(policy);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }
}

pub fn build_app(state: AppState) -> Router {
    let config = state.config.clone();
    let security = SecurityState::new(&config.security, state.rate_limiter.clone());
    let interceptor = InterceptorState::new(config.upload_dir.clone(), state.storage.clone());

    let mut protected = Router::new()
        .merge(http::streamable::router(
            http::streamable::StreamableState {
                config: config.clone(),
                server: state.server.clone(),
                sessions: state.sessions.clone(),
                sse_sessions: state.sse_sessions.clone(),
                interceptor: interceptor.clone(),
            },
        ))
        .merge(http::handlers::upload_router(config.clone()));

    if config.sse.enabled {
        protected = protected.merge(http::sse::router(http::sse::SseState {
            config: config.clone(),
            sessions: state.sse_sessions.clone(),
            streamable_sessions: state.sessions.clone(),
            interceptor,
        }));
    }

    // Last added runs first: host check, then rate limit, then token.
    let protected = protected
        .route_layer(middleware::from_fn_with_state(
            security.clone(),
            security::require_bearer_token,
        ))
        .route_layer(middleware::from_fn_with_state(
            security.clone(),
            security::enforce_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(
            security.clone(),
            security::enforce_dns_rebinding_protection,
        ));

    let public = http::handlers::health_router(config.clone()).route_layer(
        middleware::from_fn_with_state(security, security::enforce_dns_rebinding_protection),
    );

    let mut app = Router::new().merge(public).merge(protected);
    if let Some(dir) = &config.storage_dir {
        app = app.nest_service("/files", ServeDir::new(dir));
    }

    app.layer(cors_layer(&config.cors_origins))
        .layer(middleware::from_fn(logging::request_logging_middleware))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let session_header = HeaderName::from_static(MCP_SESSION_ID_HEADER);
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            session_header.clone(),
            HeaderName::from_static("mcp-protocol-version"),
            HeaderName::from_static("last-event-id"),
        ])
        .expose_headers([session_header]);

    if origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Map, Value};
    use tower::ServiceExt;

    use crate::config::{SessionMode, TransportKind};
    use crate::domain::provider::{MediaOutput, MediaProvider, UnconfiguredProvider};
    use crate::domain::tools::{EyesAnalyzeTool, EyesCompareTool, HandsGenImageTool, MouthSpeakTool};
    use crate::errors::AppError;
    use crate::session::SessionOwnership;

    use super::*;

    const INITIALIZE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","clientInfo":{"name":"test-client","version":"1.0.0"},"capabilities":{}}}"#;
    const TOOLS_LIST: &str = r#"{"jsonrpc":"2.0","id":2,"method":"tools/list","params":{}}"#;

    #[derive(Default)]
    struct RecordingProvider {
        sources: Mutex<Vec<String>>,
    }

    impl RecordingProvider {
        fn recorded(&self) -> Vec<String> {
            self.sources.lock().expect("sources lock").clone()
        }

        fn output(&self) -> MediaOutput {
            MediaOutput {
                summary: "ok".to_string(),
                data: Map::new(),
            }
        }
    }

    #[async_trait]
    impl MediaProvider for RecordingProvider {
        async fn analyze(&self, request: &EyesAnalyzeTool) -> Result<MediaOutput, AppError> {
            self.sources
                .lock()
                .expect("sources lock")
                .push(request.source.clone());
            Ok(self.output())
        }

        async fn compare(&self, request: &EyesCompareTool) -> Result<MediaOutput, AppError> {
            let mut sources = self.sources.lock().expect("sources lock");
            sources.push(request.source1.clone());
            sources.push(request.source2.clone());
            Ok(self.output())
        }

        async fn generate_image(&self, _request: &HandsGenImageTool) -> Result<MediaOutput, AppError> {
            Ok(self.output())
        }

        async fn speak(&self, _request: &MouthSpeakTool) -> Result<MediaOutput, AppError> {
            Ok(self.output())
        }
    }

    struct RejectAll;

    impl RateLimitPolicy for RejectAll {
        fn check(&self, _request: &axum::extract::Request) -> Result<(), String> {
            Err("Too many requests".to_string())
        }
    }

    fn test_config(mode: SessionMode) -> Config {
        Config {
            transport: TransportKind::Http,
            session_mode: mode,
            sse: config::SseConfig {
                enabled: true,
                ..Config::default().sse
            },
            ..Config::default()
        }
    }

    fn state_with(config: Config) -> AppState {
        AppState::new(
            config,
            Arc::new(McpServer::new(Arc::new(UnconfiguredProvider::new()))),
        )
    }

    fn state(mode: SessionMode) -> AppState {
        state_with(test_config(mode))
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "localhost:3000")
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        request("POST", uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream")
            .body(Body::from(body.to_string()))
            .expect("request build")
    }

    fn post_json_with_session(session_id: &str, body: &str) -> Request<Body> {
        request("POST", "/mcp")
            .header(header::CONTENT_TYPE, "application/json")
            .header(MCP_SESSION_ID_HEADER, session_id)
            .body(Body::from(body.to_string()))
            .expect("request build")
    }

    async fn body_json(response: Response) -> Value {
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&body).expect("valid json response")
    }

    fn session_header(response: &Response) -> Option<String> {
        response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    async fn initialize(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(post_json("/mcp", INITIALIZE))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        session_header(&response).expect("session header")
    }

    #[tokio::test]
    async fn health_reports_transport_configuration() {
        let response = build_app(state(SessionMode::Stateful))
            .oneshot(request("GET", "/health").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["transport"], "http");
        assert_eq!(body["sessionMode"], "stateful");
        assert_eq!(body["sseFallback"], "enabled");
        assert_eq!(body["ssePaths"]["stream"], "/sse");
        assert_eq!(body["ssePaths"]["message"], "/messages");
    }

    #[tokio::test]
    async fn stateless_health_omits_sse_fields() {
        let body = body_json(
            build_app(state(SessionMode::Stateless))
                .oneshot(request("GET", "/health").body(Body::empty()).expect("request build"))
                .await
                .expect("request execution"),
        )
        .await;

        assert_eq!(body["sessionMode"], "stateless");
        assert!(body.get("sseFallback").is_none());
        assert!(body.get("ssePaths").is_none());
    }

    #[tokio::test]
    async fn stateless_post_needs_no_session() {
        let app = build_app(state(SessionMode::Stateless));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post_json("/mcp", TOOLS_LIST))
                .await
                .expect("request execution");

            assert_eq!(response.status(), StatusCode::OK);
            assert!(session_header(&response).is_none());
            let body = body_json(response).await;
            assert_eq!(body["result"]["tools"][0]["name"], "eyes_analyze");
        }
    }

    #[tokio::test]
    async fn stateless_get_and_delete_are_not_allowed() {
        let app = build_app(state(SessionMode::Stateless));

        for method in ["GET", "DELETE"] {
            let response = app
                .clone()
                .oneshot(request(method, "/mcp").body(Body::empty()).expect("request build"))
                .await
                .expect("request execution");

            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            let body = body_json(response).await;
            assert_eq!(body["error"]["code"], -32000);
            assert!(body["id"].is_null());
        }
    }

    #[tokio::test]
    async fn stateless_sse_routes_are_not_allowed() {
        let app = build_app(state(SessionMode::Stateless));

        let stream = app
            .clone()
            .oneshot(request("GET", "/sse").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");
        assert_eq!(stream.status(), StatusCode::METHOD_NOT_ALLOWED);

        let message = app
            .oneshot(post_json("/messages?sessionId=abc", TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(message.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_json(message).await["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn stateful_initialize_issues_session() {
        let state = state(SessionMode::Stateful);
        let app = build_app(state.clone());

        let first = initialize(&app).await;
        let second = initialize(&app).await;

        assert_ne!(first, second);
        assert!(state.sessions.has_session(&first));
        assert_eq!(state.sessions.session_count(), 2);

        let response = app
            .oneshot(post_json_with_session(&first, TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session_header(&response).as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn stateful_initialize_result_negotiates_version() {
        let response = build_app(state(SessionMode::Stateful))
            .oneshot(post_json("/mcp", INITIALIZE))
            .await
            .expect("request execution");

        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(body["result"]["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert!(body["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn garbage_session_is_rejected() {
        let app = build_app(state(SessionMode::Stateful));

        let response = app
            .oneshot(post_json_with_session("not-a-session", TOOLS_LIST))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32600);
        assert!(body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("No valid session ID"));
        assert!(body["id"].is_null());
    }

    #[tokio::test]
    async fn missing_session_for_non_initialize_is_rejected() {
        let response = build_app(state(SessionMode::Stateful))
            .oneshot(post_json("/mcp", TOOLS_LIST))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn second_initialize_on_session_is_rejected() {
        let app = build_app(state(SessionMode::Stateful));
        let session_id = initialize(&app).await;

        let response = app
            .oneshot(post_json_with_session(&session_id, INITIALIZE))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn notification_only_post_is_accepted() {
        let app = build_app(state(SessionMode::Stateful));
        let session_id = initialize(&app).await;

        let response = app
            .oneshot(post_json_with_session(
                &session_id,
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let response = build_app(state(SessionMode::Stateless))
            .oneshot(post_json("/mcp", "{not json"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn get_opens_notification_stream_for_known_session() {
        let app = build_app(state(SessionMode::Stateful));
        let session_id = initialize(&app).await;

        let response = app
            .clone()
            .oneshot(
                request("GET", "/mcp")
                    .header(MCP_SESSION_ID_HEADER, &session_id)
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );

        let missing = app
            .oneshot(request("GET", "/mcp").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(missing).await["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let state = state(SessionMode::Stateful);
        let app = build_app(state.clone());
        let session_id = initialize(&app).await;

        for session in [session_id.as_str(), session_id.as_str(), "never-created"] {
            let response = app
                .clone()
                .oneshot(
                    request("DELETE", "/mcp")
                        .header(MCP_SESSION_ID_HEADER, session)
                        .body(Body::empty())
                        .expect("request build"),
                )
                .await
                .expect("request execution");
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let without_header = app
            .clone()
            .oneshot(request("DELETE", "/mcp").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");
        assert_eq!(without_header.status(), StatusCode::NO_CONTENT);

        assert!(!state.sessions.has_session(&session_id));
        let response = app
            .oneshot(post_json_with_session(&session_id, TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sse_session_id_is_rejected_on_streamable_endpoint() {
        let state = state(SessionMode::Stateful);
        let (sse, _stream) = state
            .sse_sessions
            .create_session("/messages")
            .expect("sse session");

        let response = build_app(state.clone())
            .oneshot(post_json_with_session(sse.session_id(), INITIALIZE))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32600);
        assert!(body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("already in use by SSE transport"));
        assert_eq!(state.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn streamable_session_id_is_rejected_on_message_endpoint() {
        let state = state(SessionMode::Stateful);
        let app = build_app(state.clone());
        let session_id = initialize(&app).await;

        let response = app
            .oneshot(post_json(
                &format!("/messages?sessionId={session_id}"),
                TOOLS_LIST,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("streamable HTTP transport"));
        assert!(!state.sse_sessions.has_session(&session_id));
    }

    #[tokio::test]
    async fn message_endpoint_requires_session_id() {
        let app = build_app(state(SessionMode::Stateful));

        let missing = app
            .clone()
            .oneshot(post_json("/messages", TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(missing).await["error"]["message"]
            .as_str()
            .expect("message")
            .contains("Missing sessionId"));

        let unknown = app
            .oneshot(post_json("/messages?sessionId=unknown", TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(unknown).await["error"]["message"]
            .as_str()
            .expect("message")
            .contains("No active SSE session"));
    }

    #[tokio::test]
    async fn sse_stream_announces_endpoint_and_accepts_messages() {
        let state = state(SessionMode::Stateful);
        let app = build_app(state.clone());

        let response = app
            .clone()
            .oneshot(request("GET", "/sse").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.sse_sessions.session_count(), 1);

        let mut body = response.into_body();
        let frame = body
            .frame()
            .await
            .expect("endpoint frame")
            .expect("frame ok")
            .into_data()
            .expect("data frame");
        let text = String::from_utf8(frame.to_vec()).expect("utf8 event");
        assert!(text.starts_with("event: endpoint\n"));
        let session_id = text
            .split("sessionId=")
            .nth(1)
            .expect("session id in endpoint")
            .trim()
            .to_string();
        assert!(state.sse_sessions.has_session(&session_id));

        let accepted = app
            .clone()
            .oneshot(post_json(
                &format!("/messages?sessionId={session_id}"),
                r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);

        let rejected = app
            .oneshot(post_json_with_session(&session_id, TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        drop(body);
        assert_eq!(state.sse_sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn sse_routes_absent_when_disabled() {
        let mut config = test_config(SessionMode::Stateful);
        config.sse.enabled = false;

        let response = build_app(state_with(config))
            .oneshot(request("GET", "/sse").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn foreign_host_is_forbidden_everywhere() {
        let app = build_app(state(SessionMode::Stateless));

        for (method, uri) in [("GET", "/health"), ("POST", "/mcp")] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .header(header::HOST, "evil.example.com")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(TOOLS_LIST))
                        .expect("request build"),
                )
                .await
                .expect("request execution");

            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            let body = body_json(response).await;
            assert_eq!(body["error"]["code"], -32001);
            assert!(body["id"].is_null());
        }
    }

    #[tokio::test]
    async fn dns_rebinding_check_can_be_disabled() {
        let mut config = test_config(SessionMode::Stateless);
        config.security.dns_rebinding_protection = false;

        let response = build_app(state_with(config))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::HOST, "evil.example.com")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_secret_is_enforced_when_configured() {
        let mut config = test_config(SessionMode::Stateless);
        config.security.secret = Some("s3cret".to_string());
        let app = build_app(state_with(config));

        let missing = app
            .clone()
            .oneshot(post_json("/mcp", TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(missing).await["error"]["code"], -32001);

        let wrong = app
            .clone()
            .oneshot(
                request("POST", "/mcp")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::from(TOOLS_LIST))
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let accepted = app
            .clone()
            .oneshot(
                request("POST", "/mcp")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::from(TOOLS_LIST))
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(accepted.status(), StatusCode::OK);

        let health = app
            .oneshot(request("GET", "/health").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rate_limit_rejects_before_auth() {
        let mut config = test_config(SessionMode::Stateless);
        config.security.secret = Some("s3cret".to_string());
        let app = build_app(state_with(config).with_rate_limiter(Arc::new(RejectAll)));

        let response = app
            .clone()
            .oneshot(post_json("/mcp", TOOLS_LIST))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(response).await["error"]["code"], -32029);

        let health = app
            .oneshot(request("GET", "/health").body(Body::empty()).expect("request build"))
            .await
            .expect("request execution");
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn session_store_rehydrates_across_app_states() {
        let store: Arc<dyn SessionStore> = Arc::new(session::store::InMemorySessionStore::new());
        let first = build_app(state(SessionMode::Stateful).with_session_store(store.clone()));
        let session_id = initialize(&first).await;

        let second = build_app(state(SessionMode::Stateful).with_session_store(store));
        let response = second
            .oneshot(post_json_with_session(&session_id, TOOLS_LIST))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session_header(&response).as_deref(), Some(session_id.as_str()));
    }

    fn recording_state(
        mode: SessionMode,
        upload_dir: &std::path::Path,
        storage_dir: &std::path::Path,
    ) -> (AppState, Arc<RecordingProvider>) {
        let provider = Arc::new(RecordingProvider::default());
        let config = Config {
            upload_dir: upload_dir.to_path_buf(),
            storage_dir: Some(storage_dir.to_path_buf()),
            storage_public_url: "http://localhost:3000/files".to_string(),
            ..test_config(mode)
        };
        let state = AppState::new(config, Arc::new(McpServer::new(provider.clone())));
        (state, provider)
    }

    fn recording_app(
        upload_dir: &std::path::Path,
        storage_dir: &std::path::Path,
    ) -> (Router, Arc<RecordingProvider>) {
        let (state, provider) = recording_state(SessionMode::Stateless, upload_dir, storage_dir);
        (build_app(state), provider)
    }

    fn is_empty_dir(dir: &std::path::Path) -> bool {
        std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    fn analyze_call(arguments: Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 11,
            "method": "tools/call",
            "params": { "name": "eyes_analyze", "arguments": arguments }
        })
        .to_string()
    }

    #[tokio::test]
    async fn unstaged_virtual_path_returns_suggestions() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        let (app, provider) = recording_app(uploads.path(), objects.path());

        let response = app
            .oneshot(post_json(
                "/mcp",
                &analyze_call(json!({ "source": "/mnt/user-data/missing.png" })),
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["id"], 11);
        assert_eq!(body["error"]["code"], -32602);
        let suggestions = body["error"]["data"]["suggestions"]
            .as_array()
            .expect("suggestions");
        assert!(suggestions
            .iter()
            .any(|item| item == "Upload the file using the /mcp/upload endpoint first"));
        assert!(provider.recorded().is_empty());
    }

    #[tokio::test]
    async fn staged_virtual_path_is_replaced_with_storage_url() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        std::fs::write(uploads.path().join("photo.png"), b"png").expect("stage file");
        let (app, provider) = recording_app(uploads.path(), objects.path());

        let response = app
            .oneshot(post_json(
                "/mcp",
                &analyze_call(json!({ "source": "/mnt/user-data/photo.png" })),
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let recorded = provider.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].starts_with("http://localhost:3000/files/"));
        assert!(recorded[0].ends_with("photo.png"));
        assert!(!uploads.path().join("photo.png").exists());
    }

    #[tokio::test]
    async fn urls_and_data_uris_pass_through_unchanged() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        let (app, provider) = recording_app(uploads.path(), objects.path());
        let body = json!({
            "jsonrpc": "2.0",
            "id": 12,
            "method": "tools/call",
            "params": {
                "name": "eyes_compare",
                "arguments": {
                    "source1": "https://example.com/a.png?x=1&y=%20",
                    "source2": "data:image/png;base64,iVBORw0KGgo="
                }
            }
        })
        .to_string();

        let response = app
            .oneshot(post_json("/mcp", &body))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            provider.recorded(),
            vec![
                "https://example.com/a.png?x=1&y=%20".to_string(),
                "data:image/png;base64,iVBORw0KGgo=".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn upload_then_reference_resolves() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        let (app, provider) = recording_app(uploads.path(), objects.path());

        let upload = app
            .clone()
            .oneshot(
                request("POST", "/mcp/upload?filename=../diagram.png")
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(Body::from(&b"diagram-bytes"[..]))
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(upload.status(), StatusCode::CREATED);
        let staged = body_json(upload).await;
        assert_eq!(staged["fileName"], "diagram.png");
        assert_eq!(staged["path"], "/mnt/user-data/diagram.png");
        assert_eq!(staged["size"], 13);

        let response = app
            .clone()
            .oneshot(post_json(
                "/mcp",
                &analyze_call(json!({ "source": "/mnt/user-data/diagram.png" })),
            ))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);

        let url = provider.recorded().pop().expect("recorded source");
        let key = url.rsplit('/').next().expect("object key");
        let served = app
            .oneshot(
                request("GET", &format!("/files/{key}"))
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(served.status(), StatusCode::OK);
        let bytes = served
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(&bytes[..], b"diagram-bytes");
    }

    #[tokio::test]
    async fn upload_requires_filename() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        let (app, _) = recording_app(uploads.path(), objects.path());

        let response = app
            .oneshot(
                request("POST", "/mcp/upload")
                    .body(Body::from("bytes"))
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn inline_payload_replaces_unstaged_virtual_path() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        let (app, provider) = recording_app(uploads.path(), objects.path());

        let response = app
            .oneshot(post_json(
                "/mcp",
                &analyze_call(json!({
                    "source": "/mnt/user-data/x.png",
                    "base64": "aGVsbG8="
                })),
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            provider.recorded(),
            vec!["data:image/png;base64,aGVsbG8=".to_string()]
        );
    }

    #[tokio::test]
    async fn rejected_session_leaves_staged_file_in_place() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        std::fs::write(uploads.path().join("keep.png"), b"png").expect("stage file");
        let (state, provider) = recording_state(SessionMode::Stateful, uploads.path(), objects.path());
        let (sse, _stream) = state
            .sse_sessions
            .create_session("/messages")
            .expect("sse session");
        let app = build_app(state);
        let call = analyze_call(json!({ "source": "/mnt/user-data/keep.png" }));

        for session_id in ["not-a-session", sse.session_id()] {
            let response = app
                .clone()
                .oneshot(post_json_with_session(session_id, &call))
                .await
                .expect("request execution");

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"]["code"], -32600);
        }

        assert!(uploads.path().join("keep.png").exists());
        assert!(is_empty_dir(objects.path()));
        assert!(provider.recorded().is_empty());
    }

    #[tokio::test]
    async fn message_endpoint_rewrites_virtual_paths() {
        let uploads = tempfile::tempdir().expect("tempdir");
        let objects = tempfile::tempdir().expect("tempdir");
        let (state, provider) = recording_state(SessionMode::Stateful, uploads.path(), objects.path());
        let (sse, _stream) = state
            .sse_sessions
            .create_session("/messages")
            .expect("sse session");

        let response = build_app(state)
            .oneshot(post_json(
                &format!("/messages?sessionId={}", sse.session_id()),
                &analyze_call(json!({ "source": "/mnt/user-data/missing.png" })),
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["id"], 11);
        assert_eq!(body["error"]["code"], -32602);
        assert_eq!(body["error"]["data"]["path"], "/mnt/user-data/missing.png");
        assert!(body["error"]["data"]["suggestions"].is_array());
        assert!(provider.recorded().is_empty());
    }

    #[tokio::test]
    async fn cors_preflight_allows_any_origin() {
        let response = build_app(state(SessionMode::Stateful))
            .oneshot(
                request("OPTIONS", "/mcp")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|value| value.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn cors_exposes_session_header() {
        let response = build_app(state(SessionMode::Stateful))
            .oneshot(
                request("POST", "/mcp")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(INITIALIZE))
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(session_header(&response).is_some());
        let exposed = response
            .headers()
            .get(header::ACCESS_CONTROL_EXPOSE_HEADERS)
            .and_then(|value| value.to_str().ok())
            .expect("expose-headers present")
            .to_ascii_lowercase();
        assert!(exposed.contains("mcp-session-id"));
    }
}
