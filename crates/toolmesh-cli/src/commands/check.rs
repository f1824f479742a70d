//! Single health probe.

use toolmesh_mcp::health::HealthCheckOptions;
use toolmesh_mcp::HealthChecker;

use crate::output;
use crate::AppContext;

/// How much a probe checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Quick,
    Standard,
    Comprehensive,
}

pub async fn run(ctx: &AppContext, server_id: &str, depth: Depth) -> anyhow::Result<()> {
    let Some(server) = ctx.config.servers.iter().find(|s| s.id == server_id) else {
        anyhow::bail!("Unknown server '{}'. Run `toolmesh servers` to list them.", server_id);
    };
    if !server.enabled {
        anyhow::bail!("Server '{}' is disabled", server_id);
    }

    let client = ctx.client();
    let checker = HealthChecker::new(client.clone(), ctx.config.monitoring.health_check_timeout());

    println!("Probing {} ({})...", server.display_name(), server.target());
    let result = match depth {
        Depth::Quick => checker.quick_connection_test(server_id).await,
        Depth::Standard => {
            checker
                .check_server_health(server_id, &HealthCheckOptions::default())
                .await
        }
        Depth::Comprehensive => checker.comprehensive_health_check(server_id).await,
    };
    client.disconnect_all().await;

    output::print_check_result(server_id, &result);
    if !result.success {
        anyhow::bail!("health check failed for '{}'", server_id);
    }
    Ok(())
}
