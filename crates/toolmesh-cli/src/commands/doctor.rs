//! Diagnostic command to check configuration.

use std::path::{Path, PathBuf};

use toolmesh_core::config::IssueSeverity;
use toolmesh_core::{Config, TransportConfig};

use crate::AppContext;

pub fn run(ctx: &AppContext) -> anyhow::Result<()> {
    println!("Running diagnostics...\n");

    // Check config directory
    let config_dir = Config::config_dir();
    println!("Config directory: {:?}", config_dir);
    if config_dir.exists() {
        println!("  ✓ Exists");
    } else {
        println!("  ✗ Does not exist");
    }

    println!("\nConfig files:");
    for path in [
        config_dir.join("config.toml"),
        PathBuf::from(".toolmesh/config.toml"),
        PathBuf::from(".toolmesh/config.local.toml"),
    ] {
        let mark = if path.is_file() { "✓" } else { "-" };
        println!("  {} {}", mark, path.display());
    }

    // Validation
    println!("\nValidation:");
    let result = ctx.config.validate();
    if result.issues.is_empty() {
        println!("  ✓ No issues");
    }
    for issue in &result.issues {
        let mark = match issue.severity {
            IssueSeverity::Error => "✗",
            IssueSeverity::Warning => "!",
        };
        println!("  {} {}: {}", mark, issue.field, issue.message);
    }

    // Servers
    println!("\nServers:");
    if ctx.config.servers.is_empty() {
        println!("  ✗ No servers configured");
    }
    for server in &ctx.config.servers {
        if !server.enabled {
            println!("  - {} (disabled)", server.id);
            continue;
        }
        match &server.transport {
            TransportConfig::Stdio { command, .. } => {
                if find_command(command).is_some() {
                    println!("  ✓ {}: `{}` found", server.id, command);
                } else {
                    println!("  ✗ {}: `{}` not found on PATH", server.id, command);
                }
            }
            TransportConfig::Http { url, .. } => {
                println!("  ✓ {}: {}", server.id, url);
            }
        }
    }

    let m = &ctx.config.monitoring;
    println!("\nMonitoring: {}", if m.enabled { "enabled" } else { "disabled" });
    println!(
        "  every {}ms, timeout {}ms, unhealthy after {} failures",
        m.health_check_interval_ms, m.health_check_timeout_ms, m.failure_threshold
    );
    println!(
        "  reconnect: {} (base {}ms, max {}ms, {} attempts)",
        if m.auto_reconnect { "on" } else { "off" },
        m.reconnect_interval_ms,
        m.max_backoff_ms,
        m.max_reconnect_attempts
    );
    println!("Strategy: {}", ctx.config.load_balancing.strategy);

    println!("\nDiagnostics complete.");
    if !result.is_ok() {
        anyhow::bail!("configuration has {} error(s)", result.errors().len());
    }
    Ok(())
}

/// Resolve a command the way a shell would.
fn find_command(command: &str) -> Option<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|candidate| candidate.is_file())
    })
}
