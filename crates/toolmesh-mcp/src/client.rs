//! MCP client implementation.
//!
//! `McpConnection` manages one server connection; `McpClient` owns the
//! configured servers and is the [`SessionProvider`] the health subsystem
//! drives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use toolmesh_core::ServerConfig;

use crate::error::McpError;
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, McpToolDefinition,
};
use crate::session::{Pinger, ResourceUsage, Session, SessionProvider, ToolLister};
use crate::transport::{self, Transport};

/// Connection state for an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Connected but not initialized.
    Connected,
    /// Connection established and initialized.
    Ready,
    /// Connection is being closed.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// A connection to a single MCP server.
pub struct McpConnection {
    server_id: String,
    transport: Mutex<Box<dyn Transport>>,
    state: RwLock<ConnectionState>,
    server_info: RwLock<Option<InitializeResult>>,
    cached_tools: RwLock<Vec<McpToolDefinition>>,
    request_counter: AtomicU64,
}

impl McpConnection {
    /// Create a new connection with an existing transport.
    pub fn new(server_id: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            server_id: server_id.into(),
            transport: Mutex::new(transport),
            state: RwLock::new(ConnectionState::Connected),
            server_info: RwLock::new(None),
            cached_tools: RwLock::new(Vec::new()),
            request_counter: AtomicU64::new(1),
        }
    }

    /// Get the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Check if the connection is ready for use.
    pub async fn is_ready(&self) -> bool {
        *self.state.read().await == ConnectionState::Ready
    }

    /// Handshake result, once initialized.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().await.clone()
    }

    /// Tools seen by the last successful `tools/list`.
    pub async fn tools(&self) -> Vec<McpToolDefinition> {
        self.cached_tools.read().await.clone()
    }

    async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, McpError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        let request_json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        // Hold the transport for the full round trip so replies can't interleave
        let mut transport = self.transport.lock().await;
        transport.send(&request_json).await?;
        let response_json = transport.receive().await?;

        let response: JsonRpcResponse<R> = serde_json::from_str(&response_json)
            .map_err(|e| McpError::protocol(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(McpError::server_error(error.code, error.message));
        }

        response
            .result
            .ok_or_else(|| McpError::protocol("Response missing result"))
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let notification: JsonRpcNotification<()> = JsonRpcNotification::new(method, None);
        let notification_json = serde_json::to_string(&notification)?;

        let mut transport = self.transport.lock().await;
        transport.send(&notification_json).await?;
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<(), McpError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Ready {
            return Err(McpError::invalid_state("ready", state.to_string()));
        }
        Ok(())
    }

    /// Run the initialize handshake.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Err(McpError::invalid_state("connected", state.to_string()));
        }

        let result: InitializeResult = self
            .request("initialize", Some(InitializeParams::default()))
            .await
            .map_err(|e| McpError::init_failed(format!("{}: {}", self.server_id, e)))?;

        self.notify("notifications/initialized").await?;

        info!(
            server = %self.server_id,
            server_name = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "MCP connection initialized"
        );

        *self.server_info.write().await = Some(result);
        *self.state.write().await = ConnectionState::Ready;

        Ok(())
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<(), McpError> {
        let state = *self.state.read().await;
        if state == ConnectionState::Disconnected {
            return Ok(());
        }

        *self.state.write().await = ConnectionState::Closing;

        let result = self.transport.lock().await.close().await;
        *self.state.write().await = ConnectionState::Disconnected;
        result?;

        debug!(server = %self.server_id, "MCP connection closed");
        Ok(())
    }
}

#[async_trait]
impl ToolLister for McpConnection {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.ensure_ready().await?;

        let result: ListToolsResult = self.request::<(), _>("tools/list", None).await?;
        debug!(server = %self.server_id, tool_count = result.tools.len(), "Listed tools");

        *self.cached_tools.write().await = result.tools.clone();
        Ok(result.tools)
    }
}

#[async_trait]
impl Pinger for McpConnection {
    async fn ping(&self) -> Result<(), McpError> {
        self.ensure_ready().await?;
        let _: Value = self.request::<(), _>("ping", None).await?;
        Ok(())
    }
}

#[async_trait]
impl Session for McpConnection {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn is_active(&self) -> bool {
        self.is_ready().await && self.transport.lock().await.is_connected()
    }

    fn tool_lister(&self) -> Option<&dyn ToolLister> {
        Some(self)
    }

    fn pinger(&self) -> Option<&dyn Pinger> {
        Some(self)
    }

    async fn resource_usage(&self) -> Option<ResourceUsage> {
        let pid = self.transport.lock().await.pid()?;
        let memory_bytes = resident_memory(pid).await;
        memory_bytes.map(|bytes| ResourceUsage {
            memory_bytes: Some(bytes),
            cpu_percent: None,
        })
    }
}

/// Resident set size of a process, read from procfs.
#[cfg(target_os = "linux")]
async fn resident_memory(pid: u32) -> Option<u64> {
    const PAGE_SIZE: u64 = 4096;
    let statm = tokio::fs::read_to_string(format!("/proc/{}/statm", pid)).await.ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

#[cfg(not(target_os = "linux"))]
async fn resident_memory(_pid: u32) -> Option<u64> {
    None
}

/// Client for managing multiple MCP server connections.
pub struct McpClient {
    configs: HashMap<String, ServerConfig>,
    connections: RwLock<HashMap<String, Arc<McpConnection>>>,
}

impl McpClient {
    /// Create a client that knows the given servers.
    pub fn with_servers(servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        let configs = servers.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            configs,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to a configured server, replacing any existing connection.
    pub async fn connect(&self, server_id: &str) -> Result<Arc<McpConnection>, McpError> {
        let config = self
            .configs
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

        if !config.enabled {
            return Err(McpError::ServerDisabled(server_id.to_string()));
        }

        info!(server = %config.id, target = %config.target(), "Connecting to MCP server");

        let transport = transport::open(&config.transport).await?;
        let connection = Arc::new(McpConnection::new(config.id.clone(), transport));

        if let Err(e) = connection.initialize().await {
            let _ = connection.close().await;
            return Err(e);
        }

        let previous = self
            .connections
            .write()
            .await
            .insert(config.id.clone(), Arc::clone(&connection));
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }

        Ok(connection)
    }

    /// Disconnect from an MCP server.
    pub async fn disconnect(&self, server_id: &str) -> Result<(), McpError> {
        let connection = self.connections.write().await.remove(server_id);
        match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    /// Disconnect from all servers.
    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<McpConnection>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, conn)| conn).collect()
        };

        for connection in connections {
            if let Err(e) = connection.close().await {
                error!(server = %connection.server_id(), error = %e, "Failed to close connection");
            }
        }
    }

    /// Get a connection by server id.
    pub async fn get(&self, server_id: &str) -> Option<Arc<McpConnection>> {
        self.connections.read().await.get(server_id).cloned()
    }
}

#[async_trait]
impl SessionProvider for McpClient {
    async fn is_connected(&self, server_id: &str) -> bool {
        match self.get(server_id).await {
            Some(connection) => connection.is_active().await,
            None => false,
        }
    }

    async fn create_session(
        &self,
        server_id: &str,
        force_new: bool,
    ) -> Result<Arc<dyn Session>, McpError> {
        if !force_new {
            if let Some(existing) = self.get(server_id).await {
                if existing.is_active().await {
                    return Ok(existing as Arc<dyn Session>);
                }
            }
        }

        let connection = self.connect(server_id).await?;
        Ok(connection as Arc<dyn Session>)
    }

    async fn close_session(&self, server_id: &str) -> Result<(), McpError> {
        self.disconnect(server_id).await
    }

    async fn active_sessions(&self) -> HashMap<String, Arc<dyn Session>> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, conn)| (id.clone(), Arc::clone(conn) as Arc<dyn Session>))
            .collect()
    }
}
