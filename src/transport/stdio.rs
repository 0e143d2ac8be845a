//! Stdio transport: JSON-RPC lines in on stdin, out on stdout.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::AppError;
use crate::mcp::rpc::{json_rpc_error, PARSE_ERROR};
use crate::mcp::server::McpServer;

/// Stdio transport for desktop MCP clients. One message per line.
pub struct StdioTransport {
    server: Arc<McpServer>,
}

impl StdioTransport {
    pub fn new(server: Arc<McpServer>) -> Self {
        Self { server }
    }

    pub async fn run(&self) -> Result<(), AppError> {
        self.run_with(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Runs the loop until EOF on `reader`.
    pub async fn run_with<R, W>(&self, mut reader: R, mut writer: W) -> Result<(), AppError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();
        tracing::info!("stdio transport started");

        loop {
            line.clear();
            let bytes_read = reader
                .read_line(&mut line)
                .await
                .map_err(|err| AppError::internal(format!("failed to read stdin: {err}")))?;

            if bytes_read == 0 {
                tracing::info!("EOF on stdin, shutting down stdio transport");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Value>(trimmed) {
                Ok(payload) => self.server.handle_payload(payload, None).await,
                Err(err) => {
                    tracing::warn!(error = %err, "stdio parse error");
                    Some(json_rpc_error(None, PARSE_ERROR, "Parse error"))
                }
            };

            if let Some(response) = response {
                let mut framed = response.to_string();
                framed.push('\n');
                writer
                    .write_all(framed.as_bytes())
                    .await
                    .map_err(|err| AppError::internal(format!("failed to write stdout: {err}")))?;
                writer
                    .flush()
                    .await
                    .map_err(|err| AppError::internal(format!("failed to flush stdout: {err}")))?;
            }
        }

        Ok(())
    }
}
