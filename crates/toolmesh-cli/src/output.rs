//! Terminal formatting helpers.

use chrono::{DateTime, Local, Utc};
use toolmesh_mcp::health::{HealthCheckResult, HealthStatus, HealthSummary, ServerHealthInfo};

pub fn status_icon(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "✓",
        HealthStatus::Degraded => "~",
        HealthStatus::Unhealthy => "✗",
        HealthStatus::Disconnected => "-",
        HealthStatus::Reconnecting => "↻",
    }
}

pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.with_timezone(&Local).format("%H:%M:%S").to_string(),
        None => "never".to_string(),
    }
}

/// Human-readable milliseconds, e.g. `850ms`, `12.5s`, `3m 20s`.
pub fn format_millis(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

pub fn print_health_table(records: &[ServerHealthInfo]) {
    println!(
        "  {:<20} {:<13} {:>9} {:>7} {:>8}  {:<8} {}",
        "SERVER", "STATUS", "AVG", "ERRORS", "FAILS", "CIRCUIT", "LAST CHECK"
    );
    for info in records {
        let circuit = if info.is_circuit_breaker_open {
            "open"
        } else {
            "closed"
        };
        println!(
            "{} {:<20} {:<13} {:>9} {:>6.0}% {:>8}  {:<8} {}",
            status_icon(info.status),
            info.server_id,
            info.status.to_string(),
            format_millis(info.average_response_time.round() as u64),
            info.error_rate * 100.0,
            info.consecutive_failures,
            circuit,
            format_time(info.last_health_check),
        );
        if let Some(error) = &info.last_error {
            println!("    last error: {}", error);
        }
    }
}

pub fn print_summary(summary: &HealthSummary) {
    println!(
        "\n{} Overall: {} ({} servers: {} healthy, {} degraded, {} unhealthy, {} disconnected, {} reconnecting)",
        status_icon(summary.overall_status),
        summary.overall_status,
        summary.total,
        summary.healthy,
        summary.degraded,
        summary.unhealthy,
        summary.disconnected,
        summary.reconnecting,
    );
    if summary.circuit_breakers_open > 0 {
        println!("  Open circuit breakers: {}", summary.circuit_breakers_open);
    }
    println!(
        "  Average response time: {}",
        format_millis(summary.average_response_time.round() as u64)
    );
}

pub fn print_check_result(server_id: &str, result: &HealthCheckResult) {
    let icon = if result.success { "✓" } else { "✗" };
    println!("{} {} in {}", icon, server_id, format_millis(result.response_time));
    if let Some(error) = &result.error {
        println!("  Error: {}", error);
    }
    let details = &result.details;
    println!("  Connection:      {:?}", details.connection_status);
    println!("  Session active:  {}", details.session_active);
    println!("  Tools available: {}", details.tools_available);
    if let Some(bytes) = details.memory_usage {
        println!("  Memory:          {} MB", bytes / 1024 / 1024);
    }
    if let Some(cpu) = details.cpu_usage {
        println!("  CPU:             {:.1}%", cpu);
    }
    if details.error_count > 0 {
        println!("  Secondary check failures: {}", details.error_count);
    }
}
