//! Session abstractions consumed by the health subsystem.
//!
//! A [`SessionProvider`] owns live sessions keyed by server id. Sessions
//! expose optional capabilities; a session that cannot list tools or answer a
//! ping is still considered healthy as long as it exists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::McpError;
use crate::protocol::McpToolDefinition;

/// Lists the tools a server offers.
#[async_trait]
pub trait ToolLister: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;
}

/// Answers a cheap round-trip liveness request.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self) -> Result<(), McpError>;
}

/// Best-effort resource gauges for a session's server.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// Resident memory in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU usage in percent.
    pub cpu_percent: Option<f64>,
}

/// A live session to one server.
#[async_trait]
pub trait Session: Send + Sync {
    /// Id of the server this session talks to.
    fn server_id(&self) -> &str;

    /// Whether the underlying transport is still usable.
    async fn is_active(&self) -> bool {
        true
    }

    fn tool_lister(&self) -> Option<&dyn ToolLister> {
        None
    }

    fn pinger(&self) -> Option<&dyn Pinger> {
        None
    }

    async fn resource_usage(&self) -> Option<ResourceUsage> {
        None
    }
}

/// Opens, tracks and closes sessions per server id.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Whether a live session exists for the server.
    async fn is_connected(&self, server_id: &str) -> bool;

    /// Return the live session, or open one. `force_new` discards any
    /// existing session first.
    async fn create_session(
        &self,
        server_id: &str,
        force_new: bool,
    ) -> Result<Arc<dyn Session>, McpError>;

    /// Close and forget the session for the server.
    async fn close_session(&self, server_id: &str) -> Result<(), McpError>;

    /// Snapshot of every open session.
    async fn active_sessions(&self) -> HashMap<String, Arc<dyn Session>>;
}
