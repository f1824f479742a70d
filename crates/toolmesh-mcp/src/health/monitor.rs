//! Periodic health monitoring.
//!
//! [`ServerHealthMonitor`] owns one [`ServerHealthInfo`] per server, probes
//! every server on a fixed interval, folds each result into the record and
//! publishes [`HealthEvent`]s on transitions. It also owns the circuit
//! breaker per server and drives the [`ReconnectionManager`] when a probe
//! cannot even run.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use toolmesh_core::MonitoringConfig;

use super::checker::HealthChecker;
use super::events::{EventEmitter, HealthEvent, ListenerId, ReconnectionEvent};
use super::reconnect::{ReconnectionConfig, ReconnectionManager};
use super::types::{
    CircuitState, HealthCheckOptions, HealthCheckResult, HealthStatus, HealthSummary,
    ServerHealthInfo,
};
use crate::error::McpError;
use crate::session::SessionProvider;

struct Inner {
    config: MonitoringConfig,
    checker: HealthChecker,
    reconnection: ReconnectionManager,
    records: RwLock<HashMap<String, ServerHealthInfo>>,
    /// Registration order, used for listings.
    order: RwLock<Vec<String>>,
    events: EventEmitter<HealthEvent>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_listener: Mutex<Option<ListenerId>>,
}

/// Tracks the health of a set of servers.
#[derive(Clone)]
pub struct ServerHealthMonitor {
    inner: Arc<Inner>,
}

impl ServerHealthMonitor {
    pub fn new(provider: Arc<dyn SessionProvider>, config: MonitoringConfig) -> Self {
        let checker = HealthChecker::new(Arc::clone(&provider), config.health_check_timeout());
        let reconnection = ReconnectionManager::new(provider, ReconnectionConfig::from(&config));
        Self {
            inner: Arc::new(Inner {
                config,
                checker,
                reconnection,
                records: RwLock::new(HashMap::new()),
                order: RwLock::new(Vec::new()),
                events: EventEmitter::new(),
                loop_task: Mutex::new(None),
                reconnect_listener: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.inner.config
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.inner.checker
    }

    pub fn reconnection(&self) -> &ReconnectionManager {
        &self.inner.reconnection
    }

    pub fn events(&self) -> &EventEmitter<HealthEvent> {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    /// Seed a disconnected record for every server. The monitoring config
    /// must validate, and ids must be non-empty and unique. Does not start
    /// the monitoring loop.
    pub fn initialize<I, S>(&self, server_ids: I) -> Result<(), McpError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        check_config(&self.inner.config)?;
        let ids: Vec<String> = server_ids.into_iter().map(Into::into).collect();
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            if id.trim().is_empty() {
                return Err(McpError::InvalidConfig("server id must not be empty".to_string()));
            }
            if !seen.insert(id.as_str()) {
                return Err(McpError::InvalidConfig(format!("duplicate server id '{}'", id)));
            }
        }

        {
            let mut records = self.inner.records.write();
            let mut order = self.inner.order.write();
            for id in &ids {
                if !records.contains_key(id) {
                    records.insert(id.clone(), ServerHealthInfo::new(id.as_str()));
                    order.push(id.clone());
                }
                self.inner.reconnection.register(id);
            }
        }

        let mut listener = self.inner.reconnect_listener.lock();
        if listener.is_none() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            *listener = Some(self.inner.reconnection.events().on(move |event| {
                if let Some(inner) = weak.upgrade() {
                    ServerHealthMonitor { inner }.handle_reconnection_event(event);
                }
            }));
        }

        info!(servers = ids.len(), "Health monitor initialized");
        Ok(())
    }

    /// Start the periodic loop. No-op if it is already running.
    pub fn start_monitoring(&self) {
        let mut task = self.inner.loop_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Health monitoring already running");
            return;
        }

        let period = self.inner.config.health_check_interval();
        if period.is_zero() {
            error!("Health check interval is 0, monitoring not started");
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                ServerHealthMonitor { inner }.perform_health_checks().await;
            }
        }));

        info!(interval_ms = period.as_millis() as u64, "Health monitoring started");
    }

    pub fn stop_monitoring(&self) {
        if let Some(task) = self.inner.loop_task.lock().take() {
            task.abort();
            info!("Health monitoring stopped");
        }
    }

    pub fn is_monitoring_active(&self) -> bool {
        self.inner
            .loop_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop everything and forget all servers.
    pub fn shutdown(&self) {
        self.stop_monitoring();
        if let Some(id) = self.inner.reconnect_listener.lock().take() {
            self.inner.reconnection.events().off(id);
        }
        self.inner.reconnection.shutdown();
        self.inner.records.write().clear();
        self.inner.order.write().clear();
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.inner.order.read().clone()
    }

    /// Probe every server not currently waiting on a reconnection, in
    /// parallel, and fold the results in.
    ///
    /// A probe that merely fails (unreachable, timed out) only counts toward
    /// the failure and breaker thresholds. Only a probe task that dies is
    /// handed to the reconnection manager.
    pub async fn perform_health_checks(&self) {
        let ids: Vec<String> = self
            .server_ids()
            .into_iter()
            .filter(|id| !self.inner.reconnection.is_reconnecting(id))
            .collect();
        if ids.is_empty() {
            return;
        }

        let probes = ids.iter().map(|id| {
            let checker = self.inner.checker.clone();
            let id = id.clone();
            tokio::spawn(async move {
                checker
                    .check_server_health(&id, &HealthCheckOptions::default())
                    .await
            })
        });
        let results = join_all(probes).await;

        for (id, joined) in ids.iter().zip(results) {
            match joined {
                Ok(result) => self.update_server_health(id, &result),
                Err(e) => self.handle_health_check_failure(id, &format!("health check aborted: {}", e)),
            }
        }
        debug!(servers = ids.len(), "Health check round complete");
    }

    /// Fold one probe result into the server's record.
    pub fn update_server_health(&self, server_id: &str, result: &HealthCheckResult) {
        let breaker = &self.inner.config.circuit_breaker;
        let mut events = Vec::new();

        {
            let mut records = self.inner.records.write();
            let Some(info) = records.get_mut(server_id) else {
                debug!(server = %server_id, "Ignoring health result for unknown server");
                return;
            };

            let now = Utc::now();
            info.accrue_uptime(now);
            info.last_health_check = Some(now);
            info.record_response_time(result.response_time);
            info.record_error_rate(result.success);
            info.connection_count = u32::from(result.details.session_active);
            let previous = info.status;

            if result.success {
                info.consecutive_failures = 0;
                info.last_successful_check = Some(now);
                info.last_error = None;
                info.status = HealthStatus::Healthy;
                if result.details.memory_usage.is_some() {
                    info.memory_usage = result.details.memory_usage;
                }
                if result.details.cpu_usage.is_some() {
                    info.cpu_usage = result.details.cpu_usage;
                }

                if previous.is_recovery_source() {
                    events.push(HealthEvent::ServerHealthy {
                        server_id: server_id.to_string(),
                        previous,
                    });
                }
                if info.circuit_state != CircuitState::Closed {
                    close_circuit(info);
                    events.push(HealthEvent::CircuitBreakerClosed {
                        server_id: server_id.to_string(),
                    });
                }
            } else {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "health check failed".to_string());
                info.consecutive_failures += 1;
                info.last_error = Some(error.clone());
                events.push(HealthEvent::HealthCheckFailed {
                    server_id: server_id.to_string(),
                    error,
                });

                if info.consecutive_failures >= self.inner.config.failure_threshold {
                    info.status = HealthStatus::Unhealthy;
                    if previous != HealthStatus::Unhealthy {
                        events.push(HealthEvent::ServerUnhealthy {
                            server_id: server_id.to_string(),
                            consecutive_failures: info.consecutive_failures,
                        });
                    }
                } else if matches!(previous, HealthStatus::Healthy | HealthStatus::Degraded) {
                    info.status = HealthStatus::Degraded;
                }

                if let Some(event) = maybe_open_circuit(info, breaker.enabled, breaker.failure_threshold) {
                    events.push(event);
                }
            }

            if previous != info.status {
                info!(
                    server = %server_id,
                    from = %previous,
                    to = %info.status,
                    "Server health changed"
                );
            }
        }

        for event in events {
            self.inner.events.emit(event);
        }
    }

    /// Record a probe that could not run at all and hand the server to the
    /// reconnection manager.
    pub fn handle_health_check_failure(&self, server_id: &str, error: &str) {
        let breaker = &self.inner.config.circuit_breaker;
        let opened = {
            let mut records = self.inner.records.write();
            let Some(info) = records.get_mut(server_id) else {
                return;
            };
            let now = Utc::now();
            info.accrue_uptime(now);
            info.last_health_check = Some(now);
            info.record_error_rate(false);
            info.consecutive_failures += 1;
            info.connection_count = 0;
            info.last_error = Some(error.to_string());
            info.status = HealthStatus::Disconnected;
            maybe_open_circuit(info, breaker.enabled, breaker.failure_threshold)
        };

        error!(server = %server_id, error = %error, "Health check pipeline failed");
        self.inner.events.emit(HealthEvent::ServerDisconnected {
            server_id: server_id.to_string(),
            error: error.to_string(),
        });
        if let Some(event) = opened {
            self.inner.events.emit(event);
        }

        if self.inner.config.auto_reconnect {
            self.inner.reconnection.schedule_reconnection(server_id);
        }
    }

    fn handle_reconnection_event(&self, event: &ReconnectionEvent) {
        match event {
            ReconnectionEvent::Started { server_id, .. } => {
                self.set_status_if(server_id, HealthStatus::Reconnecting, |s| {
                    s != HealthStatus::Healthy
                });
            }
            ReconnectionEvent::BackoffDelay {
                server_id,
                delay_ms,
                attempt,
            } => {
                debug!(server = %server_id, delay_ms, attempt, "Waiting before reconnection attempt");
            }
            ReconnectionEvent::Success { server_id, .. } => {
                self.inner.events.emit(HealthEvent::ServerReconnected {
                    server_id: server_id.clone(),
                });
            }
            ReconnectionEvent::Failed {
                server_id,
                error,
                attempt,
            } => {
                if let Some(info) = self.inner.records.write().get_mut(server_id) {
                    info.last_error = Some(error.clone());
                }
                self.inner.events.emit(HealthEvent::ReconnectionFailed {
                    server_id: server_id.clone(),
                    error: error.clone(),
                    attempt: *attempt,
                });
            }
            ReconnectionEvent::Abandoned { server_id, attempts } => {
                warn!(server = %server_id, attempts, "Reconnection abandoned, server left disconnected");
                self.set_status_if(server_id, HealthStatus::Disconnected, |_| true);
            }
        }
    }

    fn set_status_if(&self, server_id: &str, status: HealthStatus, when: impl Fn(HealthStatus) -> bool) {
        if let Some(info) = self.inner.records.write().get_mut(server_id) {
            if when(info.status) {
                info.status = status;
            }
        }
    }

    pub fn get_server_health(&self, server_id: &str) -> Option<ServerHealthInfo> {
        self.inner.records.read().get(server_id).cloned()
    }

    /// Every record, in registration order.
    pub fn get_all_server_health(&self) -> Vec<ServerHealthInfo> {
        let records = self.inner.records.read();
        self.inner
            .order
            .read()
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect()
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        HealthSummary::from_records(self.inner.records.read().values())
    }

    /// Probe one server now, bypassing the loop and any pending reconnection.
    pub async fn force_health_check(&self, server_id: &str) -> Result<HealthCheckResult, McpError> {
        if !self.inner.records.read().contains_key(server_id) {
            return Err(McpError::ServerNotFound(server_id.to_string()));
        }
        let result = self
            .inner
            .checker
            .check_server_health(server_id, &HealthCheckOptions::default())
            .await;
        self.update_server_health(server_id, &result);
        Ok(result)
    }

    /// Manual reconnection. On success the server is probed right away so
    /// its record reflects the new session.
    pub async fn reconnect_server(&self, server_id: &str) -> Result<bool, McpError> {
        if !self.inner.records.read().contains_key(server_id) {
            return Err(McpError::ServerNotFound(server_id.to_string()));
        }
        let reconnected = self.inner.reconnection.reconnect_server(server_id).await;
        if reconnected {
            self.force_health_check(server_id).await?;
        }
        Ok(reconnected)
    }

    /// Whether the breaker lets a selection through right now. Read-only:
    /// use [`try_admit`](Self::try_admit) to actually hand the server out.
    ///
    /// Unknown servers and disabled breakers always admit.
    pub fn circuit_allows(&self, server_id: &str) -> bool {
        let breaker = &self.inner.config.circuit_breaker;
        if !breaker.enabled {
            return true;
        }
        let records = self.inner.records.read();
        let Some(info) = records.get(server_id) else {
            return true;
        };
        match info.circuit_state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => info.half_open_calls < breaker.half_open_max_calls,
            CircuitState::Open => {
                breaker.half_open_max_calls > 0 && recovery_elapsed(info, breaker.recovery_timeout())
            }
        }
    }

    /// Check the breaker and count the selection under one lock. Moves an
    /// open breaker whose recovery timeout has passed to half-open; each
    /// half-open admission uses up one trial call.
    pub fn try_admit(&self, server_id: &str) -> bool {
        let breaker = &self.inner.config.circuit_breaker;
        if !breaker.enabled {
            return true;
        }
        let mut records = self.inner.records.write();
        let Some(info) = records.get_mut(server_id) else {
            return true;
        };
        match info.circuit_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !recovery_elapsed(info, breaker.recovery_timeout())
                    || breaker.half_open_max_calls == 0
                {
                    return false;
                }
                info.circuit_state = CircuitState::HalfOpen;
                info.is_circuit_breaker_open = false;
                info.half_open_calls = 1;
                info!(server = %server_id, "Circuit breaker half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if info.half_open_calls >= breaker.half_open_max_calls {
                    return false;
                }
                info.half_open_calls += 1;
                true
            }
        }
    }
}

/// Reject monitoring settings the loop and backoff cannot run with.
pub(crate) fn check_config(config: &MonitoringConfig) -> Result<(), McpError> {
    let result = config.validate();
    if result.is_ok() {
        return Ok(());
    }
    let errors: Vec<String> = result
        .errors()
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect();
    Err(McpError::InvalidConfig(errors.join("; ")))
}

fn recovery_elapsed(info: &ServerHealthInfo, timeout: std::time::Duration) -> bool {
    let Some(opened_at) = info.circuit_opened_at else {
        return true;
    };
    let elapsed = (Utc::now() - opened_at).to_std().unwrap_or_default();
    elapsed >= timeout
}

fn close_circuit(info: &mut ServerHealthInfo) {
    info.circuit_state = CircuitState::Closed;
    info.is_circuit_breaker_open = false;
    info.circuit_opened_at = None;
    info.half_open_calls = 0;
    info!(server = %info.server_id, "Circuit breaker closed");
}

fn maybe_open_circuit(info: &mut ServerHealthInfo, enabled: bool, threshold: u32) -> Option<HealthEvent> {
    if !enabled || info.consecutive_failures < threshold || info.circuit_state == CircuitState::Open {
        return None;
    }
    info.circuit_state = CircuitState::Open;
    info.is_circuit_breaker_open = true;
    info.circuit_opened_at = Some(Utc::now());
    info.half_open_calls = 0;
    warn!(
        server = %info.server_id,
        failures = info.consecutive_failures,
        "Circuit breaker opened"
    );
    Some(HealthEvent::CircuitBreakerOpened {
        server_id: info.server_id.clone(),
        consecutive_failures: info.consecutive_failures,
    })
}
