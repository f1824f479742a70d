//! Configuration system for Toolmesh.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Main configuration struct for Toolmesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Health monitoring and reconnection settings
    pub monitoring: MonitoringConfig,
    /// Server selection settings
    pub load_balancing: LoadBalancingConfig,
    /// Tool servers to connect to
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Health monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Run the periodic health-check loop
    pub enabled: bool,
    /// Interval between monitoring ticks (ms)
    pub health_check_interval_ms: u64,
    /// Upper bound for a single probe (ms)
    pub health_check_timeout_ms: u64,
    /// Consecutive failures before a server is marked unhealthy
    pub failure_threshold: u32,
    /// Schedule reconnection when a server drops
    pub auto_reconnect: bool,
    /// Base reconnection delay (ms)
    pub reconnect_interval_ms: u64,
    /// Attempts before reconnection is abandoned
    pub max_reconnect_attempts: u32,
    /// Ceiling for the exponential backoff (ms)
    pub max_backoff_ms: u64,
    /// Pause between closing a stale session and reopening it (ms)
    pub reconnect_settle_ms: u64,
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            failure_threshold: 3,
            auto_reconnect: true,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 5,
            max_backoff_ms: 300_000,
            reconnect_settle_ms: 1_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl MonitoringConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    /// Check the timing and threshold rules. Server entries are checked by
    /// [`Config::validate`].
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.health_check_interval_ms == 0 {
            result.add_error(
                "monitoring.health_check_interval_ms",
                "health_check_interval_ms must be greater than 0",
            );
        }

        if self.health_check_timeout_ms == 0 {
            result.add_error(
                "monitoring.health_check_timeout_ms",
                "health_check_timeout_ms must be greater than 0",
            );
        } else if self.health_check_timeout_ms >= self.health_check_interval_ms {
            result.add_warning(
                "monitoring.health_check_timeout_ms",
                "timeout is not shorter than the check interval; ticks will run back to back",
            );
        }

        if self.failure_threshold == 0 {
            result.add_error("monitoring.failure_threshold", "failure_threshold must be greater than 0");
        }

        if self.reconnect_interval_ms == 0 {
            result.add_error(
                "monitoring.reconnect_interval_ms",
                "reconnect_interval_ms must be greater than 0",
            );
        }

        if self.max_backoff_ms < self.reconnect_interval_ms {
            result.add_error(
                "monitoring.max_backoff_ms",
                "max_backoff_ms cannot be lower than reconnect_interval_ms",
            );
        }

        if self.max_reconnect_attempts == 0 && self.auto_reconnect {
            result.add_warning(
                "monitoring.max_reconnect_attempts",
                "auto_reconnect is on but max_reconnect_attempts is 0",
            );
        }

        let cb = &self.circuit_breaker;
        if cb.enabled {
            if cb.failure_threshold == 0 {
                result.add_error(
                    "monitoring.circuit_breaker.failure_threshold",
                    "failure_threshold must be greater than 0",
                );
            } else if cb.failure_threshold < self.failure_threshold {
                result.add_warning(
                    "monitoring.circuit_breaker.failure_threshold",
                    "breaker opens before the server is marked unhealthy",
                );
            }
            if cb.half_open_max_calls == 0 {
                result.add_warning(
                    "monitoring.circuit_breaker.half_open_max_calls",
                    "half_open_max_calls is 0; an open breaker only closes through health checks",
                );
            }
        }

        result
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Track breaker state at all
    pub enabled: bool,
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before admitting trial selections (ms)
    pub recovery_timeout_ms: u64,
    /// Trial selections allowed while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Server selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Highest `priority` wins
    #[default]
    PriorityBased,
    /// Fewest active connections wins
    LeastConnections,
    /// Time-based rotation
    RoundRobin,
    /// Uniform random choice
    Random,
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriorityBased => write!(f, "priority-based"),
            Self::LeastConnections => write!(f, "least-connections"),
            Self::RoundRobin => write!(f, "round-robin"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl std::str::FromStr for LoadBalancingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority-based" | "priority" => Ok(Self::PriorityBased),
            "least-connections" => Ok(Self::LeastConnections),
            "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(Error::Config(format!(
                "unknown load balancing strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
}

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a child process and speak newline-delimited JSON over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
    /// POST JSON-RPC messages to an HTTP endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Configuration for a single tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether this server is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Selection priority (higher is preferred).
    #[serde(default)]
    pub priority: i32,
    /// Transport definition.
    pub transport: TransportConfig,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            enabled: true,
            priority: 0,
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
                working_dir: None,
            },
        }
    }

    /// Create an HTTP server configuration.
    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            enabled: true,
            priority: 0,
            transport: TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
        }
    }

    /// Add arguments (stdio only).
    pub fn with_args(mut self, new_args: Vec<String>) -> Self {
        if let TransportConfig::Stdio { ref mut args, .. } = self.transport {
            *args = new_args;
        }
        self
    }

    /// Add an environment variable (stdio only).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { ref mut env, .. } = self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Add a request header (http only).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Http {
            ref mut headers, ..
        } = self.transport
        {
            headers.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Name to show to humans.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Short description of the transport target.
    pub fn target(&self) -> String {
        match &self.transport {
            TransportConfig::Stdio { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            TransportConfig::Http { url, .. } => url.clone(),
        }
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "monitoring.failure_threshold")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Layered figment: defaults, user, project, local, environment.
    pub fn figment() -> Figment {
        let config_dir = Self::config_dir();

        Figment::new()
            .merge(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file(config_dir.join("config.toml")))
            .merge(Toml::file(".toolmesh/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".toolmesh/config.local.toml"))
            .merge(Env::prefixed("TOOLMESH_").split("__"))
    }

    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Validate, logging warnings and failing on errors.
    pub fn check(&self) -> Result<(), Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = self.monitoring.validate();

        let mut seen = HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            let field = format!("servers[{}]", index);

            if server.id.trim().is_empty() {
                result.add_error(format!("{}.id", field), "server id cannot be empty");
            } else if !seen.insert(server.id.as_str()) {
                result.add_error(
                    format!("{}.id", field),
                    format!("duplicate server id '{}'", server.id),
                );
            }

            match &server.transport {
                TransportConfig::Stdio { command, .. } => {
                    if command.trim().is_empty() {
                        result.add_error(format!("{}.transport.command", field), "command cannot be empty");
                    }
                }
                TransportConfig::Http { url, .. } => {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        result.add_error(
                            format!("{}.transport.url", field),
                            "url must start with http:// or https://",
                        );
                    }
                }
            }
        }

        result
    }

    /// Enabled servers, in configuration order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("toolmesh"))
            .unwrap_or_else(|| PathBuf::from("~/.config/toolmesh"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.is_ok(), "Default config should be valid: {:?}", result.issues);
        assert!(result.warnings().is_empty());
    }

    #[test]
    fn test_zero_failure_threshold() {
        let mut config = Config::default();
        config.monitoring.failure_threshold = 0;
        let result = config.validate();
        assert!(!result.is_ok());
        assert!(result.errors().iter().any(|e| e.field == "monitoring.failure_threshold"));
    }

    #[test]
    fn test_duplicate_server_ids() {
        let mut config = Config::default();
        config.servers = vec![
            ServerConfig::stdio("fs", "npx"),
            ServerConfig::http("fs", "http://localhost:8080/mcp"),
        ];
        let result = config.validate();
        assert!(!result.is_ok());
        assert!(result.errors().iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn test_invalid_http_url() {
        let mut config = Config::default();
        config.servers = vec![ServerConfig::http("remote", "localhost:8080")];
        let result = config.validate();
        assert!(result.errors().iter().any(|e| e.field == "servers[0].transport.url"));
    }

    #[test]
    fn test_low_breaker_threshold_is_warning() {
        let mut config = Config::default();
        config.monitoring.circuit_breaker.failure_threshold = 1;
        let result = config.validate();
        assert!(result.is_ok());
        assert!(result
            .warnings()
            .iter()
            .any(|w| w.field == "monitoring.circuit_breaker.failure_threshold"));
    }

    #[test]
    fn test_monitoring_rules_without_servers() {
        let monitoring = MonitoringConfig {
            health_check_interval_ms: 0,
            reconnect_interval_ms: 0,
            ..Default::default()
        };
        let result = monitoring.validate();
        assert!(!result.is_ok());
        let fields: Vec<&str> = result.errors().iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"monitoring.health_check_interval_ms"));
        assert!(fields.contains(&"monitoring.reconnect_interval_ms"));
        assert!(MonitoringConfig::default().validate().is_ok());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "least-connections".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::LeastConnections
        );
        assert_eq!(LoadBalancingStrategy::RoundRobin.to_string(), "round-robin");
        assert!("fastest".parse::<LoadBalancingStrategy>().is_err());
    }

    #[test]
    fn test_server_builder() {
        let server = ServerConfig::stdio("fs", "npx")
            .with_args(vec!["-y".to_string(), "server-filesystem".to_string()])
            .with_env("NODE_ENV", "production")
            .with_priority(10);

        assert_eq!(server.target(), "npx -y server-filesystem");
        assert_eq!(server.display_name(), "fs");
        assert_eq!(server.priority, 10);
        assert!(server.enabled);
    }

    #[test]
    fn test_load_from_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir(".toolmesh")?;
            jail.create_file(
                ".toolmesh/config.toml",
                r#"
                [monitoring]
                failure_threshold = 2

                [monitoring.circuit_breaker]
                failure_threshold = 4

                [load_balancing]
                strategy = "round-robin"

                [[servers]]
                id = "fs"
                priority = 5
                transport = { type = "stdio", command = "npx", args = ["-y", "fs"] }

                [[servers]]
                id = "search"
                enabled = false
                transport = { type = "http", url = "https://search.example.com/mcp" }
                "#,
            )?;
            jail.set_env("TOOLMESH_MONITORING__MAX_RECONNECT_ATTEMPTS", "7");

            let config = Config::load()?;
            assert_eq!(config.monitoring.failure_threshold, 2);
            assert_eq!(config.monitoring.circuit_breaker.failure_threshold, 4);
            assert_eq!(config.monitoring.max_reconnect_attempts, 7);
            assert_eq!(config.load_balancing.strategy, LoadBalancingStrategy::RoundRobin);
            assert_eq!(config.servers.len(), 2);
            assert_eq!(config.enabled_servers().count(), 1);
            assert!(matches!(
                config.servers[1].transport,
                TransportConfig::Http { .. }
            ));
            Ok(())
        });
    }
}
