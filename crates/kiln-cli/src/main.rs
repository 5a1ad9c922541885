mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => commands::serve(config).await,
        Command::Leases { label, state, host_id } => {
            commands::leases(cli.server, label, state, host_id).await
        }
        Command::Hosts => commands::hosts(cli.server).await,
        Command::Events { lease_id, limit } => {
            commands::events(cli.server, lease_id, limit).await
        }
        Command::Terminate { lease_id, reason } => {
            commands::terminate(cli.server, lease_id, reason).await
        }
    }
}
