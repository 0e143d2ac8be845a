//! Model Context Protocol engine shared by every transport
//!
//! `rpc` holds the JSON-RPC envelope helpers, `server` the method dispatch.

pub mod rpc;
pub mod server;
