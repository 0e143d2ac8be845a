//! Tool catalog and the media provider seam
//!
//! Provides the eyes/hands/mouth tools exposed over the MCP protocol

pub mod provider;
pub mod tools;
pub mod utils;
