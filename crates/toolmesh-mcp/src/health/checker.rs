//! Single-shot health probes.
//!
//! A probe makes sure a session exists for the server and then gathers
//! optional diagnostics. Only failing to obtain a session fails the probe;
//! tool listing, ping and resource gauges are best-effort and show up in
//! [`HealthCheckDetails::error_count`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{ConnectionStatus, HealthCheckDetails, HealthCheckOptions, HealthCheckResult};
use crate::error::McpError;
use crate::session::SessionProvider;

/// Timeout used by [`HealthChecker::quick_connection_test`].
pub const QUICK_CHECK_TIMEOUT: Duration = Duration::from_millis(3000);

/// Error reported when a probe exceeds its deadline.
pub const TIMEOUT_ERROR: &str = "Health check timeout";

/// Runs probes against servers through a [`SessionProvider`].
#[derive(Clone)]
pub struct HealthChecker {
    provider: Arc<dyn SessionProvider>,
    default_timeout: Duration,
}

impl HealthChecker {
    pub fn new(provider: Arc<dyn SessionProvider>, default_timeout: Duration) -> Self {
        Self {
            provider,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Probe a server. Never returns an error; failures and timeouts are
    /// reported in the result.
    pub async fn check_server_health(
        &self,
        server_id: &str,
        options: &HealthCheckOptions,
    ) -> HealthCheckResult {
        let deadline = options.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();

        match tokio::time::timeout(deadline, self.probe(server_id, options)).await {
            Ok(Ok(details)) => HealthCheckResult {
                success: true,
                response_time: start.elapsed().as_millis() as u64,
                error: None,
                details,
            },
            Ok(Err(e)) => {
                debug!(server = %server_id, error = %e, "Health probe failed");
                let details = HealthCheckDetails {
                    connection_status: ConnectionStatus::Error,
                    ..Default::default()
                };
                HealthCheckResult::failure(e.to_string(), start.elapsed(), details)
            }
            Err(_) => {
                warn!(
                    server = %server_id,
                    timeout_ms = deadline.as_millis() as u64,
                    "Health probe timed out"
                );
                HealthCheckResult::failure(TIMEOUT_ERROR, start.elapsed(), Default::default())
            }
        }
    }

    async fn probe(
        &self,
        server_id: &str,
        options: &HealthCheckOptions,
    ) -> Result<HealthCheckDetails, McpError> {
        let mut details = HealthCheckDetails::default();

        if !self.provider.is_connected(server_id).await {
            debug!(server = %server_id, "No live session, opening one for probe");
        }
        let session = self.provider.create_session(server_id, false).await?;

        details.connection_status = ConnectionStatus::Connected;
        details.session_active = session.is_active().await;

        if options.tool_check_enabled() {
            match session.tool_lister() {
                Some(lister) => match lister.list_tools().await {
                    Ok(tools) => details.tools_available = tools.len(),
                    Err(e) => {
                        warn!(server = %server_id, error = %e, "Tool listing failed during probe");
                        details.error_count += 1;
                    }
                },
                None => debug!(server = %server_id, "Session cannot list tools, skipping"),
            }
        }

        if options.include_memory_check {
            match session.resource_usage().await {
                Some(usage) => {
                    details.memory_usage = usage.memory_bytes;
                    details.cpu_usage = usage.cpu_percent;
                }
                None => debug!(server = %server_id, "No resource usage available"),
            }
        }

        if options.test_tool_execution {
            let exercised = if let Some(pinger) = session.pinger() {
                pinger.ping().await
            } else if let Some(lister) = session.tool_lister() {
                lister.list_tools().await.map(|_| ())
            } else {
                Ok(())
            };
            if let Err(e) = exercised {
                warn!(server = %server_id, error = %e, "Round-trip check failed during probe");
                details.error_count += 1;
            }
        }

        details.last_activity = Some(Utc::now());
        Ok(details)
    }

    /// Connection-only probe with a short deadline.
    pub async fn quick_connection_test(&self, server_id: &str) -> HealthCheckResult {
        let options = HealthCheckOptions {
            timeout: Some(QUICK_CHECK_TIMEOUT),
            include_tool_check: Some(false),
            include_memory_check: false,
            test_tool_execution: false,
        };
        self.check_server_health(server_id, &options).await
    }

    /// Probe with every diagnostic enabled.
    pub async fn comprehensive_health_check(&self, server_id: &str) -> HealthCheckResult {
        let options = HealthCheckOptions {
            timeout: None,
            include_tool_check: Some(true),
            include_memory_check: true,
            test_tool_execution: true,
        };
        self.check_server_health(server_id, &options).await
    }

    /// True when a short probe with tool listing succeeds on a connected,
    /// active session.
    pub async fn is_server_responsive(&self, server_id: &str) -> bool {
        let options = HealthCheckOptions {
            timeout: Some(QUICK_CHECK_TIMEOUT),
            include_tool_check: Some(true),
            include_memory_check: false,
            test_tool_execution: false,
        };
        let result = self.check_server_health(server_id, &options).await;
        result.success
            && result.details.connection_status == ConnectionStatus::Connected
            && result.details.session_active
    }
}
