//! Preview server selection.

use toolmesh_core::LoadBalancingStrategy;

use crate::AppContext;

pub async fn run(ctx: &AppContext, strategy: Option<LoadBalancingStrategy>) -> anyhow::Result<()> {
    let manager = ctx.manager()?;
    if let Some(monitor) = manager.monitor() {
        monitor.perform_health_checks().await;
    }

    let strategy = strategy.unwrap_or_else(|| manager.strategy());
    let chosen = manager.select_with_strategy(None, strategy);
    manager.shutdown().await;

    match chosen {
        Some(server) => {
            println!(
                "{} ({}) via {}",
                server.id,
                server.display_name(),
                strategy
            );
            Ok(())
        }
        None => anyhow::bail!("no eligible server (all disabled or circuit breakers open)"),
    }
}
