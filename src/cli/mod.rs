//! CLI module for pgsched
//!
//! Provides commands:
//! - `serve`: run the scheduler service
//! - `keygen`: write a fresh credential keypair
//! - `rotate-keys`: re-seal every data-source credential under a new key
//! - `dry-run`: execute a job once without recording it
//! - `runs`: browse a job's run history

use crate::server::config::AppConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod dry_run;
pub mod keygen;
pub mod rotate;
pub mod runs;

/// Scheduled read-only SQL against Postgres sources
#[derive(Parser, Debug)]
#[command(name = "pgsched")]
#[command(about = "Scheduled read-only SQL against Postgres sources")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler service
    Serve,
    /// Generate a credential keypair
    Keygen {
        /// Directory for public_key.base64 and private_key.base64
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },
    /// Re-seal stored credentials for a new keypair
    RotateKeys {
        /// Private key the credentials are currently sealed for
        #[arg(long)]
        old_private: PathBuf,
        /// Public key to seal for
        #[arg(long)]
        new_public: PathBuf,
        /// Key version recorded on re-sealed credentials
        #[arg(long)]
        new_version: i32,
        /// Open a session with each rotated credential
        #[arg(long)]
        verify: bool,
    },
    /// Execute a job once without recording a run
    DryRun {
        job_id: i64,
        /// Row limit (capped by executor.max_rows)
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Show recorded runs of a job
    Runs {
        job_id: i64,
        #[command(flatten)]
        select: runs::Selection,
        #[command(flatten)]
        window: runs::Window,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Serve) => crate::server::run(config).await,
        Some(Commands::Keygen { out_dir, force }) => keygen::run(&out_dir, force),
        Some(Commands::RotateKeys {
            old_private,
            new_public,
            new_version,
            verify,
        }) => rotate::run(&config, &old_private, &new_public, new_version, verify).await,
        Some(Commands::DryRun { job_id, limit }) => dry_run::run(&config, job_id, limit).await,
        Some(Commands::Runs {
            job_id,
            select,
            window,
        }) => runs::run(&config, job_id, &select, &window).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

