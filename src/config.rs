use std::{env, net::SocketAddr, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Both,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Both => "both",
        }
    }

    pub fn serves_http(self) -> bool {
        matches!(self, Self::Http | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Stateful,
    Stateless,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stateful => "stateful",
            Self::Stateless => "stateless",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseConfig {
    pub enabled: bool,
    pub stream_path: String,
    pub message_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConfig {
    pub dns_rebinding_protection: bool,
    pub allowed_hosts: Vec<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub session_mode: SessionMode,
    pub sse: SseConfig,
    pub cors_origins: Vec<String>,
    pub security: SecurityConfig,
    pub upload_dir: PathBuf,
    pub storage_dir: Option<PathBuf>,
    pub storage_public_url: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of stdio, http, both")]
    InvalidTransport,
    #[error("MCP_HTTP_PORT must be a valid u16")]
    InvalidPort,
    #[error("MCP_HTTP_SESSION_MODE must be stateful or stateless")]
    InvalidSessionMode,
    #[error("{0} must be true or false")]
    InvalidFlag(&'static str),
    #[error("{0} must start with '/'")]
    InvalidPath(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Default for Config {
    fn default() -> Self {
        let host = "127.0.0.1".to_string();
        let port = 3000;
        Self {
            transport: TransportKind::Stdio,
            storage_public_url: default_public_url(&host, port),
            host,
            port,
            session_mode: SessionMode::Stateful,
            sse: SseConfig {
                enabled: false,
                stream_path: "/sse".to_string(),
                message_path: "/messages".to_string(),
            },
            cors_origins: vec!["*".to_string()],
            security: SecurityConfig {
                dns_rebinding_protection: true,
                allowed_hosts: vec!["127.0.0.1".to_string(), "localhost".to_string()],
                secret: None,
            },
            upload_dir: env::temp_dir().join("human-mcp-uploads"),
            storage_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parses configuration from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let transport = match read("MCP_TRANSPORT").as_deref().map(str::to_ascii_lowercase) {
            None => defaults.transport,
            Some(value) => match value.as_str() {
                "stdio" => TransportKind::Stdio,
                "http" => TransportKind::Http,
                "both" => TransportKind::Both,
                _ => return Err(ConfigError::InvalidTransport),
            },
        };

        let host = read("MCP_HTTP_HOST").unwrap_or(defaults.host);
        let port = read("MCP_HTTP_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(defaults.port);

        let session_mode = match read("MCP_HTTP_SESSION_MODE")
            .as_deref()
            .map(str::to_ascii_lowercase)
        {
            None => defaults.session_mode,
            Some(value) => match value.as_str() {
                "stateful" => SessionMode::Stateful,
                "stateless" => SessionMode::Stateless,
                _ => return Err(ConfigError::InvalidSessionMode),
            },
        };

        let sse = SseConfig {
            enabled: parse_flag("MCP_HTTP_ENABLE_SSE", read("MCP_HTTP_ENABLE_SSE"))?
                .unwrap_or(defaults.sse.enabled),
            stream_path: parse_route("MCP_HTTP_SSE_STREAM_PATH", read("MCP_HTTP_SSE_STREAM_PATH"))?
                .unwrap_or(defaults.sse.stream_path),
            message_path: parse_route(
                "MCP_HTTP_SSE_MESSAGE_PATH",
                read("MCP_HTTP_SSE_MESSAGE_PATH"),
            )?
            .unwrap_or(defaults.sse.message_path),
        };

        let cors_origins = read("MCP_HTTP_CORS_ORIGINS")
            .map(|value| split_list(&value))
            .unwrap_or(defaults.cors_origins);

        let security = SecurityConfig {
            dns_rebinding_protection: parse_flag(
                "MCP_HTTP_DNS_REBINDING_ENABLED",
                read("MCP_HTTP_DNS_REBINDING_ENABLED"),
            )?
            .unwrap_or(defaults.security.dns_rebinding_protection),
            allowed_hosts: read("MCP_HTTP_ALLOWED_HOSTS")
                .map(|value| split_list(&value))
                .unwrap_or(defaults.security.allowed_hosts),
            secret: read("MCP_HTTP_SECRET"),
        };

        let storage_public_url = read("MCP_STORAGE_PUBLIC_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| default_public_url(&host, port));

        let config = Self {
            transport,
            host,
            port,
            session_mode,
            sse,
            cors_origins,
            security,
            upload_dir: read("MCP_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            storage_dir: read("MCP_STORAGE_DIR").map(PathBuf::from),
            storage_public_url,
        };

        if config.transport.serves_http() {
            let _ = config.bind_socket()?;
        }
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    pub fn is_stateful(&self) -> bool {
        self.session_mode == SessionMode::Stateful
    }
}

fn default_public_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/files")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(key: &'static str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    value
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidFlag(key)),
        })
        .transpose()
}

fn parse_route(key: &'static str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(path) if !path.starts_with('/') => Err(ConfigError::InvalidPath(key)),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn parse_defaults() {
        let config = parse(&[]).expect("config should parse");

        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.session_mode, SessionMode::Stateful);
        assert!(!config.sse.enabled);
        assert_eq!(config.sse.stream_path, "/sse");
        assert_eq!(config.sse.message_path, "/messages");
        assert_eq!(config.cors_origins, vec!["*"]);
        assert!(config.security.dns_rebinding_protection);
        assert_eq!(config.security.allowed_hosts, vec!["127.0.0.1", "localhost"]);
        assert_eq!(config.security.secret, None);
        assert_eq!(config.storage_dir, None);
        assert_eq!(config.storage_public_url, "http://127.0.0.1:3000/files");
    }

    #[test]
    fn parse_http_overrides() {
        let config = parse(&[
            ("MCP_TRANSPORT", "HTTP"),
            ("MCP_HTTP_HOST", "0.0.0.0"),
            ("MCP_HTTP_PORT", "8080"),
            ("MCP_HTTP_SESSION_MODE", "stateless"),
            ("MCP_HTTP_ENABLE_SSE", "true"),
            ("MCP_HTTP_SSE_MESSAGE_PATH", "/legacy/messages"),
            ("MCP_HTTP_ALLOWED_HOSTS", "example.com, api.example.com ,"),
            ("MCP_HTTP_SECRET", "  s3cret "),
            ("MCP_STORAGE_PUBLIC_URL", "https://cdn.example.com/files/"),
        ])
        .expect("config should parse");

        assert_eq!(config.transport, TransportKind::Http);
        assert_eq!(config.bind_socket().expect("socket").port(), 8080);
        assert!(!config.is_stateful());
        assert!(config.sse.enabled);
        assert_eq!(config.sse.message_path, "/legacy/messages");
        assert_eq!(
            config.security.allowed_hosts,
            vec!["example.com", "api.example.com"]
        );
        assert_eq!(config.security.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.storage_public_url, "https://cdn.example.com/files");
    }

    #[test]
    fn invalid_values_fail() {
        assert!(matches!(
            parse(&[("MCP_TRANSPORT", "pigeon")]),
            Err(ConfigError::InvalidTransport)
        ));
        assert!(matches!(
            parse(&[("MCP_HTTP_PORT", "70000")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            parse(&[("MCP_HTTP_SESSION_MODE", "sticky")]),
            Err(ConfigError::InvalidSessionMode)
        ));
        assert!(matches!(
            parse(&[("MCP_HTTP_ENABLE_SSE", "maybe")]),
            Err(ConfigError::InvalidFlag("MCP_HTTP_ENABLE_SSE"))
        ));
        assert!(matches!(
            parse(&[("MCP_HTTP_SSE_STREAM_PATH", "sse")]),
            Err(ConfigError::InvalidPath("MCP_HTTP_SSE_STREAM_PATH"))
        ));
    }

    #[test]
    fn invalid_socket_only_matters_for_http() {
        assert!(parse(&[("MCP_HTTP_HOST", "not a host")]).is_ok());
        assert!(matches!(
            parse(&[("MCP_TRANSPORT", "both"), ("MCP_HTTP_HOST", "not a host")]),
            Err(ConfigError::InvalidSocket)
        ));
    }
}
