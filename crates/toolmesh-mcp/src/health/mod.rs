//! Server health monitoring and reconnection.

pub mod checker;
pub mod events;
pub mod monitor;
pub mod reconnect;
pub mod types;

pub use checker::HealthChecker;
pub use events::{EventEmitter, HealthEvent, ListenerId, ReconnectionEvent};
pub use monitor::ServerHealthMonitor;
pub use reconnect::{ReconnectionConfig, ReconnectionManager, ReconnectionStatus};
pub use types::{
    CircuitState, ConnectionStatus, HealthCheckDetails, HealthCheckOptions, HealthCheckResult,
    HealthStatus, HealthSummary, ServerHealthInfo,
};
