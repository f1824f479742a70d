//! # toolmesh-cli
//!
//! Command-line interface for Toolmesh.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toolmesh_core::{Config, LoadBalancingStrategy};
use toolmesh_mcp::{McpClient, ServerManager};

mod commands;
mod output;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
}

impl AppContext {
    /// Client that knows every configured server.
    pub fn client(&self) -> Arc<McpClient> {
        Arc::new(McpClient::with_servers(self.config.servers.iter().cloned()))
    }

    /// Manager over the configured servers. The periodic loop is left to
    /// the caller so one-shot commands do not race it.
    pub fn manager(&self) -> anyhow::Result<ServerManager> {
        self.config.check()?;
        let mut monitoring = self.config.monitoring.clone();
        monitoring.enabled = false;
        let manager = ServerManager::new(
            self.client(),
            monitoring,
            self.config.load_balancing.strategy,
        );
        manager.initialize(self.config.servers.clone())?;
        Ok(manager)
    }
}

/// Toolmesh - health monitoring and selection for MCP tool servers
#[derive(Parser)]
#[command(name = "toolmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers
    Servers,
    /// Probe every server and show a health report
    Health {
        /// Keep monitoring and print events until Ctrl-C
        #[arg(short, long)]
        watch: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a single health probe against one server
    Check {
        /// Server id
        id: String,
        /// Connection only, short timeout
        #[arg(long, conflicts_with = "comprehensive")]
        quick: bool,
        /// Include memory and round-trip checks
        #[arg(long)]
        comprehensive: bool,
    },
    /// Reconnect a server now, resetting its retry budget
    Reconnect {
        /// Server id
        id: String,
    },
    /// Show which server would be selected
    Select {
        /// Override the configured strategy
        #[arg(short, long)]
        strategy: Option<LoadBalancingStrategy>,
    },
    /// Show version information
    Version,
    /// Diagnose configuration issues
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so the configured level applies
    let loaded = Config::load();
    let level = match (&loaded, cli.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.general.log_level.clone(),
        (Err(_), false) => "warn".to_string(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = loaded.unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });
    let ctx = AppContext { config };

    match cli.command {
        Commands::Servers => commands::servers::run(&ctx),
        Commands::Health { watch, json } => commands::health::run(&ctx, watch, json).await,
        Commands::Check {
            id,
            quick,
            comprehensive,
        } => {
            let depth = if quick {
                commands::check::Depth::Quick
            } else if comprehensive {
                commands::check::Depth::Comprehensive
            } else {
                commands::check::Depth::Standard
            };
            commands::check::run(&ctx, &id, depth).await
        }
        Commands::Reconnect { id } => commands::reconnect::run(&ctx, &id).await,
        Commands::Select { strategy } => commands::select::run(&ctx, strategy).await,
        Commands::Version => {
            println!("toolmesh {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Doctor => commands::doctor::run(&ctx),
    }
}
