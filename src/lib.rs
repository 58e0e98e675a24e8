//! Outlook MCP Server Library
//!
//! A Model Context Protocol (MCP) server for Outlook mail and calendar
//! search through Microsoft Graph.

pub mod config;
pub mod error;
pub mod graph;
pub mod mcp;

pub use config::Config;
pub use error::{OutlookMcpError, Result};
