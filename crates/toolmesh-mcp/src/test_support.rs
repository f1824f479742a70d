//! Scripted session provider shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::McpError;
use crate::protocol::McpToolDefinition;
use crate::session::{Pinger, ResourceUsage, Session, SessionProvider, ToolLister};

#[derive(Debug, Clone)]
pub(crate) struct FakeServer {
    pub connected: bool,
    /// Outcomes for upcoming session opens; `default_open` once drained.
    pub open_results: VecDeque<bool>,
    pub default_open: bool,
    /// Whether the transport reports connected right after a successful open.
    pub live_after_open: bool,
    pub open_delay: Option<Duration>,
    pub tool_count: usize,
    pub tools_fail: bool,
    pub has_tool_lister: bool,
    pub has_pinger: bool,
    pub ping_fails: bool,
    pub memory_bytes: Option<u64>,
    pub session_active: bool,
    pub panic_on_probe: bool,
    pub opens: u32,
    pub closes: u32,
    /// `tools/list` calls made through any session of this server.
    pub tool_lists: Arc<AtomicU32>,
}

impl FakeServer {
    pub fn tool_list_calls(&self) -> u32 {
        self.tool_lists.load(Ordering::SeqCst)
    }
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            connected: false,
            open_results: VecDeque::new(),
            default_open: true,
            live_after_open: true,
            open_delay: None,
            tool_count: 3,
            tools_fail: false,
            has_tool_lister: true,
            has_pinger: true,
            ping_fails: false,
            memory_bytes: None,
            session_active: true,
            panic_on_probe: false,
            opens: 0,
            closes: 0,
            tool_lists: Arc::default(),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeProvider {
    servers: Mutex<HashMap<String, FakeServer>>,
}

impl FakeProvider {
    pub fn with_servers(ids: &[&str]) -> Arc<Self> {
        let provider = Self::default();
        {
            let mut servers = provider.servers.lock();
            for id in ids {
                servers.insert(id.to_string(), FakeServer::default());
            }
        }
        Arc::new(provider)
    }

    pub fn update(&self, id: &str, f: impl FnOnce(&mut FakeServer)) {
        let mut servers = self.servers.lock();
        f(servers.entry(id.to_string()).or_default());
    }

    /// Make the server reachable or not. Going down drops the live session.
    pub fn set_reachable(&self, id: &str, reachable: bool) {
        self.update(id, |s| {
            s.default_open = reachable;
            s.open_results.clear();
            if !reachable {
                s.connected = false;
            }
        });
    }

    pub fn script_opens(&self, id: &str, outcomes: &[bool]) {
        self.update(id, |s| s.open_results = outcomes.iter().copied().collect());
    }

    pub fn server(&self, id: &str) -> FakeServer {
        self.servers.lock().get(id).cloned().unwrap_or_default()
    }

    fn session_for(id: &str, server: &FakeServer) -> Arc<dyn Session> {
        Arc::new(FakeSession {
            id: id.to_string(),
            tool_count: server.tool_count,
            tools_fail: server.tools_fail,
            has_tool_lister: server.has_tool_lister,
            has_pinger: server.has_pinger,
            ping_fails: server.ping_fails,
            memory_bytes: server.memory_bytes,
            active: server.session_active,
            tool_lists: Arc::clone(&server.tool_lists),
        })
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn is_connected(&self, server_id: &str) -> bool {
        let server = self.server(server_id);
        if server.panic_on_probe {
            panic!("probe exploded for {}", server_id);
        }
        server.connected
    }

    async fn create_session(
        &self,
        server_id: &str,
        force_new: bool,
    ) -> Result<Arc<dyn Session>, McpError> {
        let current = self.server(server_id);
        if current.connected && !force_new {
            return Ok(Self::session_for(server_id, &current));
        }

        if let Some(delay) = current.open_delay {
            tokio::time::sleep(delay).await;
        }

        let mut servers = self.servers.lock();
        let server = servers.entry(server_id.to_string()).or_default();
        let opened = server.open_results.pop_front().unwrap_or(server.default_open);
        if !opened {
            server.connected = false;
            return Err(McpError::init_failed(format!("{}: connection refused", server_id)));
        }

        server.opens += 1;
        server.connected = server.live_after_open;
        Ok(Self::session_for(server_id, server))
    }

    async fn close_session(&self, server_id: &str) -> Result<(), McpError> {
        self.update(server_id, |s| {
            s.connected = false;
            s.closes += 1;
        });
        Ok(())
    }

    async fn active_sessions(&self) -> HashMap<String, Arc<dyn Session>> {
        self.servers
            .lock()
            .iter()
            .filter(|(_, s)| s.connected)
            .map(|(id, s)| (id.clone(), Self::session_for(id, s)))
            .collect()
    }
}

pub(crate) struct FakeSession {
    id: String,
    tool_count: usize,
    tools_fail: bool,
    has_tool_lister: bool,
    has_pinger: bool,
    ping_fails: bool,
    memory_bytes: Option<u64>,
    active: bool,
    tool_lists: Arc<AtomicU32>,
}

#[async_trait]
impl ToolLister for FakeSession {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.tool_lists.fetch_add(1, Ordering::SeqCst);
        if self.tools_fail {
            return Err(McpError::protocol("tools/list glitch"));
        }
        Ok((0..self.tool_count)
            .map(|i| McpToolDefinition {
                name: format!("tool_{}", i),
                description: None,
                input_schema: serde_json::Value::Null,
            })
            .collect())
    }
}

#[async_trait]
impl Pinger for FakeSession {
    async fn ping(&self) -> Result<(), McpError> {
        if self.ping_fails {
            return Err(McpError::Timeout(100));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for FakeSession {
    fn server_id(&self) -> &str {
        &self.id
    }

    async fn is_active(&self) -> bool {
        self.active
    }

    fn tool_lister(&self) -> Option<&dyn ToolLister> {
        if self.has_tool_lister {
            Some(self)
        } else {
            None
        }
    }

    fn pinger(&self) -> Option<&dyn Pinger> {
        if self.has_pinger {
            Some(self)
        } else {
            None
        }
    }

    async fn resource_usage(&self) -> Option<ResourceUsage> {
        self.memory_bytes.map(|bytes| ResourceUsage {
            memory_bytes: Some(bytes),
            cpu_percent: None,
        })
    }
}
