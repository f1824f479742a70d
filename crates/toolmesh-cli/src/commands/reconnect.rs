//! Manual reconnection.

use crate::output;
use crate::AppContext;

pub async fn run(ctx: &AppContext, server_id: &str) -> anyhow::Result<()> {
    let manager = ctx.manager()?;

    println!("Reconnecting {}...", server_id);
    let reconnected = manager.reconnect_server(server_id).await?;

    if let Some(monitor) = manager.monitor() {
        if let Some(status) = monitor.reconnection().get_status(server_id) {
            if let Some(attempt) = &status.last_attempt {
                if let Some(error) = &attempt.error {
                    println!("  Last attempt failed: {}", error);
                }
            }
        }
    }
    if let Some(info) = manager.get_server_health(server_id) {
        output::print_health_table(&[info]);
    }

    manager.shutdown().await;

    if reconnected {
        println!("✓ {} reconnected", server_id);
        Ok(())
    } else {
        anyhow::bail!("could not reconnect '{}'", server_id)
    }
}
