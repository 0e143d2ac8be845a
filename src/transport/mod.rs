//! Concrete transports and the process-level transport manager.

pub mod lifecycle;
pub mod manager;
pub mod sse;
pub mod stdio;
pub mod streamable;

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const SSE_KEEP_ALIVE_SECS: u64 = 30;
pub const SSE_ENDPOINT_EVENT: &str = "endpoint";
pub const SSE_MESSAGE_EVENT: &str = "message";
