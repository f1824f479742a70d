//! Health report and live monitoring.

use chrono::Local;
use tokio::sync::broadcast::error::RecvError;

use crate::output;
use crate::AppContext;

pub async fn run(ctx: &AppContext, watch: bool, json: bool) -> anyhow::Result<()> {
    let manager = ctx.manager()?;
    let Some(monitor) = manager.monitor() else {
        anyhow::bail!("health monitor failed to start");
    };

    monitor.perform_health_checks().await;

    let records = manager.get_all_server_health();
    let summary = manager.get_health_summary();
    if json {
        let report = serde_json::json!({ "servers": records, "summary": summary });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if records.is_empty() {
        println!("No enabled servers to monitor.");
    } else {
        output::print_health_table(&records);
        output::print_summary(&summary);
    }

    if watch {
        let mut events = monitor.subscribe();
        monitor.start_monitoring();
        println!(
            "\nWatching every {} (Ctrl-C to stop)...",
            output::format_millis(ctx.config.monitoring.health_check_interval_ms)
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => println!("[{}] {}", Local::now().format("%H:%M:%S"), event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    output::print_health_table(&manager.get_all_server_health());
                    output::print_summary(&manager.get_health_summary());
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
