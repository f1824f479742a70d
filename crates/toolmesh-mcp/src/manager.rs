//! Server selection and request accounting on top of health monitoring.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use toolmesh_core::{Config, LoadBalancingStrategy, MonitoringConfig, ServerConfig};

use crate::client::McpClient;
use crate::error::McpError;
use crate::health::{
    HealthCheckResult, HealthEvent, HealthSummary, ServerHealthInfo, ServerHealthMonitor,
};
use crate::health::monitor::check_config;
use crate::session::SessionProvider;

/// Request counters for one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
    pub server_id: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub active_connections: u32,
    /// Sum of reported request durations (ms).
    pub total_response_time: u64,
}

impl ServerMetrics {
    fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            ..Default::default()
        }
    }

    /// Mean reported request duration (ms).
    pub fn average_response_time(&self) -> f64 {
        let completed = self.total_requests.saturating_sub(u64::from(self.active_connections));
        if completed == 0 {
            0.0
        } else {
            self.total_response_time as f64 / completed as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            1.0 - self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Chooses servers for incoming work and keeps health monitoring running.
pub struct ServerManager {
    provider: Arc<dyn SessionProvider>,
    monitoring: MonitoringConfig,
    strategy: RwLock<LoadBalancingStrategy>,
    servers: RwLock<Vec<ServerConfig>>,
    monitor: RwLock<Option<ServerHealthMonitor>>,
    metrics: RwLock<HashMap<String, ServerMetrics>>,
}

impl ServerManager {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        monitoring: MonitoringConfig,
        strategy: LoadBalancingStrategy,
    ) -> Self {
        Self {
            provider,
            monitoring,
            strategy: RwLock::new(strategy),
            servers: RwLock::new(Vec::new()),
            monitor: RwLock::new(None),
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Manager backed by an [`McpClient`] that knows every configured server.
    pub fn from_config(config: &Config) -> Self {
        let client = McpClient::with_servers(config.servers.iter().cloned());
        Self::new(
            Arc::new(client),
            config.monitoring.clone(),
            config.load_balancing.strategy,
        )
    }

    pub fn provider(&self) -> Arc<dyn SessionProvider> {
        Arc::clone(&self.provider)
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.write() = strategy;
    }

    /// Validate the monitoring config and the server set, seed health
    /// records for the enabled servers and start monitoring if it is
    /// enabled. Re-initializing replaces the previous set.
    pub fn initialize(&self, servers: Vec<ServerConfig>) -> Result<(), McpError> {
        check_config(&self.monitoring)?;
        let mut seen = HashSet::new();
        for server in &servers {
            if server.id.trim().is_empty() {
                return Err(McpError::InvalidConfig("server id must not be empty".to_string()));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(McpError::InvalidConfig(format!(
                    "duplicate server id '{}'",
                    server.id
                )));
            }
        }

        if let Some(previous) = self.monitor.write().take() {
            previous.shutdown();
        }

        let monitor = ServerHealthMonitor::new(Arc::clone(&self.provider), self.monitoring.clone());
        monitor.initialize(servers.iter().filter(|s| s.enabled).map(|s| s.id.clone()))?;
        if self.monitoring.enabled {
            monitor.start_monitoring();
        } else {
            info!("Health monitoring disabled by configuration");
        }

        *self.metrics.write() = servers
            .iter()
            .map(|s| (s.id.clone(), ServerMetrics::new(&s.id)))
            .collect();
        let enabled = servers.iter().filter(|s| s.enabled).count();
        *self.servers.write() = servers;
        *self.monitor.write() = Some(monitor);

        info!(enabled, strategy = %self.strategy(), "Server manager initialized");
        Ok(())
    }

    /// Stop monitoring and close every open session.
    pub async fn shutdown(&self) {
        if let Some(monitor) = self.monitor.write().take() {
            monitor.shutdown();
        }
        let open: Vec<String> = self.provider.active_sessions().await.into_keys().collect();
        for id in open {
            if let Err(e) = self.provider.close_session(&id).await {
                warn!(server = %id, error = %e, "Failed to close session during shutdown");
            }
        }
        info!("Server manager shut down");
    }

    pub fn monitor(&self) -> Option<ServerHealthMonitor> {
        self.monitor.read().clone()
    }

    fn require_monitor(&self) -> Result<ServerHealthMonitor, McpError> {
        self.monitor()
            .ok_or_else(|| McpError::invalid_state("initialized", "uninitialized"))
    }

    pub fn servers(&self) -> Vec<ServerConfig> {
        self.servers.read().clone()
    }

    pub fn server(&self, server_id: &str) -> Option<ServerConfig> {
        self.servers.read().iter().find(|s| s.id == server_id).cloned()
    }

    pub fn is_monitoring_active(&self) -> bool {
        self.monitor().is_some_and(|m| m.is_monitoring_active())
    }

    pub fn get_server_health(&self, server_id: &str) -> Option<ServerHealthInfo> {
        self.monitor()?.get_server_health(server_id)
    }

    pub fn get_all_server_health(&self) -> Vec<ServerHealthInfo> {
        self.monitor()
            .map(|m| m.get_all_server_health())
            .unwrap_or_default()
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        self.monitor()
            .map(|m| m.get_health_summary())
            .unwrap_or_else(|| HealthSummary::from_records(std::iter::empty::<&ServerHealthInfo>()))
    }

    pub async fn force_health_check(&self, server_id: &str) -> Result<HealthCheckResult, McpError> {
        self.require_monitor()?.force_health_check(server_id).await
    }

    pub async fn reconnect_server(&self, server_id: &str) -> Result<bool, McpError> {
        self.require_monitor()?.reconnect_server(server_id).await
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<HealthEvent>, McpError> {
        Ok(self.require_monitor()?.subscribe())
    }

    /// Pick a server with the configured strategy. `candidates` defaults to
    /// every known server.
    pub fn select_optimal_server(&self, candidates: Option<&[ServerConfig]>) -> Option<ServerConfig> {
        self.select_with_strategy(candidates, self.strategy())
    }

    /// Pick a server among enabled candidates that are not abandoned by
    /// reconnection and whose circuit breaker admits traffic. Returns `None`
    /// when nothing is eligible.
    pub fn select_with_strategy(
        &self,
        candidates: Option<&[ServerConfig]>,
        strategy: LoadBalancingStrategy,
    ) -> Option<ServerConfig> {
        let all;
        let candidates = match candidates {
            Some(candidates) => candidates,
            None => {
                all = self.servers();
                all.as_slice()
            }
        };

        let monitor = self.monitor();
        let mut eligible: Vec<&ServerConfig> = candidates
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| {
                monitor.as_ref().map_or(true, |m| {
                    !m.reconnection().is_abandoned(&s.id) && m.circuit_allows(&s.id)
                })
            })
            .collect();

        // Admission is re-checked under the breaker lock; a lost half-open
        // race drops the server and picks again.
        while !eligible.is_empty() {
            let chosen = self.pick(&eligible, strategy);
            if monitor.as_ref().map_or(true, |m| m.try_admit(&chosen.id)) {
                debug!(server = %chosen.id, %strategy, "Selected server");
                return Some(chosen.clone());
            }
            eligible.retain(|s| s.id != chosen.id);
        }

        debug!(candidates = candidates.len(), "No eligible server to select");
        None
    }

    fn pick<'a>(&self, eligible: &[&'a ServerConfig], strategy: LoadBalancingStrategy) -> &'a ServerConfig {
        match strategy {
            LoadBalancingStrategy::PriorityBased => highest_priority(eligible),
            LoadBalancingStrategy::LeastConnections => self.least_connections(eligible),
            LoadBalancingStrategy::RoundRobin => {
                let index = Utc::now().timestamp_millis().rem_euclid(eligible.len() as i64);
                eligible[index as usize]
            }
            LoadBalancingStrategy::Random => eligible
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(eligible[0]),
        }
    }

    fn least_connections<'a>(&self, eligible: &[&'a ServerConfig]) -> &'a ServerConfig {
        let metrics = self.metrics.read();
        let active = |s: &ServerConfig| metrics.get(&s.id).map_or(0, |m| m.active_connections);
        eligible
            .iter()
            .copied()
            .min_by_key(|s| active(*s))
            .unwrap_or(eligible[0])
    }

    /// Count a request handed to a server.
    pub fn record_request_start(&self, server_id: &str) {
        let mut metrics = self.metrics.write();
        let entry = metrics
            .entry(server_id.to_string())
            .or_insert_with(|| ServerMetrics::new(server_id));
        entry.total_requests += 1;
        entry.active_connections += 1;
    }

    /// Close out a request started with [`record_request_start`](Self::record_request_start).
    pub fn record_request_end(&self, server_id: &str, success: bool, response_time_ms: u64) {
        let mut metrics = self.metrics.write();
        let Some(entry) = metrics.get_mut(server_id) else {
            warn!(server = %server_id, "Request end for server with no recorded start");
            return;
        };
        entry.active_connections = entry.active_connections.saturating_sub(1);
        entry.total_response_time = entry.total_response_time.saturating_add(response_time_ms);
        if !success {
            entry.failed_requests += 1;
        }
    }

    pub fn get_metrics(&self, server_id: &str) -> Option<ServerMetrics> {
        self.metrics.read().get(server_id).cloned()
    }

    pub fn all_metrics(&self) -> Vec<ServerMetrics> {
        let metrics = self.metrics.read();
        self.servers
            .read()
            .iter()
            .filter_map(|s| metrics.get(&s.id).cloned())
            .collect()
    }
}

/// First candidate with the highest priority.
fn highest_priority<'a>(eligible: &[&'a ServerConfig]) -> &'a ServerConfig {
    eligible[1..].iter().copied().fold(eligible[0], |best, s| {
        match s.priority.cmp(&best.priority) {
            Ordering::Greater => s,
            _ => best,
        }
    })
}
