//! Health records, probe results and summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Weight kept from the previous response-time average.
pub const RESPONSE_TIME_DECAY: f64 = 0.8;

/// Amount the error rate moves per probe.
pub const ERROR_RATE_STEP: f64 = 0.1;

/// Health status of a monitored server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disconnected,
    Reconnecting,
}

impl HealthStatus {
    /// States a success counts as recovering from.
    pub fn is_recovery_source(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Disconnected | Self::Reconnecting)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Circuit breaker position.
///
/// `HalfOpen` is entered lazily, when selection asks about an open breaker
/// whose recovery timeout has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Rolling health state of one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthInfo {
    pub server_id: String,
    pub status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Decaying failure-frequency proxy in [0, 1], not a literal ratio.
    pub error_rate: f64,
    /// Exponential moving average of probe latency (ms).
    pub average_response_time: f64,
    pub connection_count: u32,
    pub memory_usage: Option<u64>,
    pub cpu_usage: Option<f64>,
    pub last_error: Option<String>,
    /// Accumulated healthy time (ms).
    pub uptime: u64,
    pub is_circuit_breaker_open: bool,
    pub circuit_state: CircuitState,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub half_open_calls: u32,
}

impl ServerHealthInfo {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            status: HealthStatus::Disconnected,
            last_health_check: None,
            last_successful_check: None,
            consecutive_failures: 0,
            error_rate: 0.0,
            average_response_time: 0.0,
            connection_count: 0,
            memory_usage: None,
            cpu_usage: None,
            last_error: None,
            uptime: 0,
            is_circuit_breaker_open: false,
            circuit_state: CircuitState::Closed,
            circuit_opened_at: None,
            half_open_calls: 0,
        }
    }

    /// Fold a latency sample into the average.
    pub fn record_response_time(&mut self, response_time_ms: u64) {
        self.average_response_time = self.average_response_time * RESPONSE_TIME_DECAY
            + response_time_ms as f64 * (1.0 - RESPONSE_TIME_DECAY);
    }

    pub fn record_error_rate(&mut self, success: bool) {
        self.error_rate = if success {
            (self.error_rate - ERROR_RATE_STEP).max(0.0)
        } else {
            (self.error_rate + ERROR_RATE_STEP).min(1.0)
        };
    }

    /// Credit healthy time elapsed since the previous check.
    pub fn accrue_uptime(&mut self, now: DateTime<Utc>) {
        if self.status != HealthStatus::Healthy {
            return;
        }
        if let Some(previous) = self.last_health_check {
            let elapsed = (now - previous).num_milliseconds().max(0) as u64;
            self.uptime = self.uptime.saturating_add(elapsed);
        }
    }
}

/// Connection state observed by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// Diagnostics gathered during one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckDetails {
    pub connection_status: ConnectionStatus,
    pub tools_available: usize,
    pub session_active: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub memory_usage: Option<u64>,
    pub cpu_usage: Option<f64>,
    /// Secondary checks that failed during this probe only.
    pub error_count: u32,
}

impl Default for HealthCheckDetails {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            tools_available: 0,
            session_active: false,
            last_activity: None,
            memory_usage: None,
            cpu_usage: None,
            error_count: 0,
        }
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub success: bool,
    /// Time spent on the probe (ms).
    pub response_time: u64,
    pub error: Option<String>,
    pub details: HealthCheckDetails,
}

impl HealthCheckResult {
    pub fn failure(error: impl Into<String>, elapsed: Duration, details: HealthCheckDetails) -> Self {
        Self {
            success: false,
            response_time: elapsed.as_millis() as u64,
            error: Some(error.into()),
            details,
        }
    }
}

/// Knobs for a single probe.
#[derive(Debug, Clone, Default)]
pub struct HealthCheckOptions {
    /// Overrides the configured health-check timeout.
    pub timeout: Option<Duration>,
    /// `None` means enabled.
    pub include_tool_check: Option<bool>,
    pub include_memory_check: bool,
    pub test_tool_execution: bool,
}

impl HealthCheckOptions {
    pub fn tool_check_enabled(&self) -> bool {
        self.include_tool_check.unwrap_or(true)
    }
}

/// Aggregate view across all monitored servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub disconnected: usize,
    pub reconnecting: usize,
    pub circuit_breakers_open: usize,
    /// Mean of the per-server response-time averages (ms).
    pub average_response_time: f64,
    pub overall_status: HealthStatus,
}

impl HealthSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ServerHealthInfo>) -> Self {
        let mut summary = Self {
            total: 0,
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            disconnected: 0,
            reconnecting: 0,
            circuit_breakers_open: 0,
            average_response_time: 0.0,
            overall_status: HealthStatus::Healthy,
        };
        let mut response_total = 0.0;

        for info in records {
            summary.total += 1;
            response_total += info.average_response_time;
            if info.is_circuit_breaker_open {
                summary.circuit_breakers_open += 1;
            }
            match info.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Disconnected => summary.disconnected += 1,
                HealthStatus::Reconnecting => summary.reconnecting += 1,
            }
        }

        if summary.total > 0 {
            summary.average_response_time = response_total / summary.total as f64;
        }

        summary.overall_status = if summary.unhealthy > 0 || summary.disconnected * 2 > summary.total {
            HealthStatus::Unhealthy
        } else if summary.healthy < summary.total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        summary
    }
}
