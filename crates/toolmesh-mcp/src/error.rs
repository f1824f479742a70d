//! MCP-specific error types.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the child process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    WriteError(std::io::Error),

    /// Failed to read from the transport.
    #[error("read error: {0}")]
    ReadError(std::io::Error),

    /// HTTP request failed or returned a non-success status.
    #[error("http error: {0}")]
    Http(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level error (malformed messages, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server not found by id.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Server is configured but disabled.
    #[error("server is disabled: {0}")]
    ServerDisabled(String),

    /// Server initialization failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Server returned an error response.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i32, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection is not in the correct state.
    #[error("invalid connection state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Operation timed out.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Server list handed to the manager is malformed.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    /// A session was opened but the transport is not live.
    #[error("session for '{0}' is not connected")]
    NotConnected(String),
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an initialization failed error.
    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a server error from JSON-RPC error.
    pub fn server_error(code: i32, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<McpError> for toolmesh_core::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::ServerNotFound(id) => toolmesh_core::Error::NotFound(format!("server '{}'", id)),
            McpError::InvalidConfig(msg) => toolmesh_core::Error::Config(msg),
            other => toolmesh_core::Error::Mcp(other.to_string()),
        }
    }
}
