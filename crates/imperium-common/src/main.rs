//! Imperium node
//!
//! Runs the shared services of one Imperium node until interrupted.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use imperium_common::Services;
use imperium_core::config::load_config;
use imperium_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "imperium-node")]
#[command(version, about = "Imperium node - shared accounts, sessions and message bus")]
struct Args {
    /// Config file. Defaults to `~/.config/imperium/config.json` if present.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Unique name of this node on the network.
    #[arg(long, env = "IMPERIUM_SERVER_NAME")]
    server_name: Option<String>,

    /// Path to the shared SQLite database.
    #[arg(long, env = "IMPERIUM_DATABASE_PATH")]
    db_path: Option<PathBuf>,

    /// Use a private in-memory database.
    #[arg(long, conflicts_with = "db_path")]
    memory: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// Seed the well-known test account on startup.
    #[arg(long)]
    testing: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(name) = args.server_name {
        config.server.name = name;
    }
    if let Some(path) = args.db_path {
        config.database.path = Some(path);
    }
    config.database.memory |= args.memory;
    config.logging.json |= args.log_json;
    config.testing |= args.testing;
    if config.database.path.is_none() && !config.database.memory {
        config.database.path = imperium_core::config::default_database_path();
    }
    config.validate()?;

    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server.name,
        "Starting imperium-node"
    );

    let services = Services::build(&config).await?;
    if config.testing {
        services.accounts.seed_test_account().await?;
    }
    services.start().await;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    services.shutdown().await;
    info!("Node stopped");
    Ok(())
}
