//! List configured servers.

use crate::AppContext;

pub fn run(ctx: &AppContext) -> anyhow::Result<()> {
    let servers = &ctx.config.servers;
    if servers.is_empty() {
        println!("No servers configured.");
        println!("Add [[servers]] entries to {:?}", toolmesh_core::Config::config_dir().join("config.toml"));
        return Ok(());
    }

    println!("Configured servers ({}):", servers.len());
    for server in servers {
        let state = if server.enabled { "✓" } else { "✗" };
        print!("  {} {} (priority {})", state, server.id, server.priority);
        if server.display_name() != server.id {
            print!(" - {}", server.display_name());
        }
        println!();
        println!("      {}", server.target());
    }
    println!("\nStrategy: {}", ctx.config.load_balancing.strategy);
    Ok(())
}
