//! MCP transport implementations.
//!
//! Two transports are provided: stdio, which spawns the server as a child
//! process and exchanges newline-delimited JSON, and HTTP, which POSTs each
//! JSON-RPC message to an endpoint and queues the replies.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use toolmesh_core::TransportConfig;

use crate::error::TransportError;

/// Trait for MCP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to the server.
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Receive a message from the server.
    async fn receive(&mut self) -> Result<String, TransportError>;

    /// Close the transport connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// OS process id backing this transport, if any.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Open a transport for the given configuration.
pub async fn open(config: &TransportConfig) -> Result<Box<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Stdio {
            command,
            args,
            env,
            working_dir,
        } => {
            let transport = StdioTransport::spawn(command, args, env, working_dir.as_ref()).await?;
            Ok(Box::new(transport))
        }
        TransportConfig::Http { url, headers } => {
            Ok(Box::new(HttpTransport::new(url.clone(), headers.clone())))
        }
    }
}

/// Standard I/O transport for MCP servers.
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    connected: bool,
}

impl StdioTransport {
    /// Spawn a new stdio transport.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&PathBuf>,
    ) -> Result<Self, TransportError> {
        debug!(command = command, args = ?args, "Spawning MCP server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdout"))
        })?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            connected: true,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let mut frame = String::with_capacity(message.len() + 1);
        frame.push_str(message);
        frame.push('\n');

        self.stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(TransportError::WriteError)?;
        self.stdin.flush().await.map_err(TransportError::WriteError)?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let mut line = String::new();
        let bytes_read = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(TransportError::ReadError)?;

        if bytes_read == 0 {
            self.connected = false;
            return Err(TransportError::ConnectionClosed);
        }

        Ok(line.trim_end().to_string())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        if let Some(pid) = self.child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                debug!(pid = pid, "Sending SIGTERM to MCP server");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

                tokio::select! {
                    _ = self.child.wait() => {
                        debug!(pid = pid, "MCP server exited gracefully");
                    }
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {
                        warn!(pid = pid, "MCP server did not exit gracefully, killing");
                        let _ = self.child.kill().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = pid;
                let _ = self.child.kill().await;
            }
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// HTTP transport: one POST per outgoing message.
///
/// Response bodies are queued and handed out by `receive`, so request/response
/// pairs keep the same shape as on stdio. Notifications usually get an empty
/// `202 Accepted`, which queues nothing.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    pending: VecDeque<String>,
    connected: bool,
}

impl HttpTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            headers,
            pending: VecDeque::new(),
            connected: true,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .body(message.to_string());
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(status.to_string()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let body = body.trim();
        if !body.is_empty() {
            self.pending.push_back(body.to_string());
        }

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.pending.pop_front().ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
