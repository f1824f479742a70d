//! Error types for Toolmesh.
//!
//! Structured errors shared by every crate in the workspace, each with an
//! optional recovery suggestion for the CLI.

use thiserror::Error;

/// Result type alias using the Toolmesh error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Toolmesh.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// MCP error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// No server passed selection
    #[error("No healthy server available")]
    NoHealthyServer,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/toolmesh/config.toml"),
            Error::NotFound(_) => Some("Use 'toolmesh servers' to see configured servers"),
            Error::NoHealthyServer => {
                Some("Run 'toolmesh health' to inspect servers, or 'toolmesh reconnect <id>'")
            }
            Error::Mcp(_) => Some("Run 'toolmesh check <id> --comprehensive' for diagnostics"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
