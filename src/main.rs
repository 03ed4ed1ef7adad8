use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use arbmesh::application::{Cli, CommandExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    CommandExecutor::execute(cli).await
}
