//! # toolmesh-mcp
//!
//! MCP (Model Context Protocol) server orchestration for Toolmesh.
//!
//! This crate provides:
//! - MCP client with stdio and HTTP transports
//! - Health probes, periodic monitoring and circuit breaking
//! - Automatic reconnection with exponential backoff
//! - Server selection across healthy servers

pub mod client;
pub mod error;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{McpClient, McpConnection};
pub use error::{McpError, TransportError};
pub use health::{
    HealthChecker, HealthEvent, HealthStatus, HealthSummary, ReconnectionManager,
    ServerHealthInfo, ServerHealthMonitor,
};
pub use manager::{ServerManager, ServerMetrics};
pub use session::{Session, SessionProvider};
