//! pgsched - scheduled read-only SQL against Postgres sources
//!
//! CLI entry point.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = server::load_config()?;
    let _log_guard = server::init_logging(&config.logging)?;
    debug!(env = ?std::env::var("PGSCHED_ENV").ok(), "Configuration loaded");

    cli::run(cli, config).await
}
