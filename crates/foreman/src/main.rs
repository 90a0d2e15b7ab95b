//! Foreman launcher.
//!
//! Boots the orchestrator control plane and runs it until interrupted.

mod fleet;
mod orchestrator;

use anyhow::Result;
use clap::{Parser, Subcommand};
use foreman_logging::{init_logging, LogConfig, RotationPolicy};
use foreman_protocol::config::SystemConfig;
use foreman_protocol::defaults;
use orchestrator::Orchestrator;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "foreman", about = "Job orchestrator for capability servers")]
struct Cli {
    /// Mirror the full log filter onto stderr.
    #[arg(long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted.
    Serve(ServeArgs),
    /// Parse a fleet file and list the workers it would register.
    CheckFleet {
        /// Path to the fleet TOML file.
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// State store URL (`memory:` or `sqlite:<path>`).
    #[arg(long, env = "FOREMAN_STATE_URL", default_value = defaults::DEFAULT_STATE_URL)]
    state: String,

    /// PEM file with the RS256 signing key.
    #[arg(long, env = "FOREMAN_SIGNING_KEY")]
    signing_key: PathBuf,

    /// PEM file(s) with acceptable verification keys, newest first.
    #[arg(long = "verify-key", env = "FOREMAN_VERIFY_KEY", required = true)]
    verify_keys: Vec<PathBuf>,

    /// Fleet TOML describing operator-hosted workers to register at boot.
    #[arg(long, env = "FOREMAN_FLEET")]
    fleet: Option<PathBuf>,

    /// Callback URL advertised to async workers.
    #[arg(long, env = "FOREMAN_CALLBACK_URL", default_value = defaults::DEFAULT_CALLBACK_URL)]
    callback_url: String,

    /// Issuer stamped into signed envelopes.
    #[arg(long, default_value = defaults::DEFAULT_ISSUER)]
    issuer: String,

    /// Directory for pointer-result blobs; in-memory when omitted.
    #[arg(long, env = "FOREMAN_BLOB_ROOT")]
    blob_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig {
        app_name: "foreman",
        verbose: cli.verbose,
        quiet: cli.quiet,
        rotation: RotationPolicy::default(),
    })?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::CheckFleet { path } => check_fleet(&path),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = SystemConfig {
        state_url: args.state,
        signing_key_path: Some(args.signing_key),
        verify_key_paths: args.verify_keys,
        fleet_path: args.fleet,
        callback_url: args.callback_url,
        issuer: args.issuer,
        blob_root: args.blob_root,
    };

    let orchestrator = Orchestrator::start(config).await?;
    info!("foreman serving; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    orchestrator.shutdown().await;
    Ok(())
}

fn check_fleet(path: &Path) -> Result<()> {
    let workers = fleet::load_fleet(path)?;
    println!("{} worker(s) in {}", workers.len(), path.display());
    for worker in workers {
        let kinds = worker.task_kinds.join(", ");
        println!("  {} [{}] -> {}", worker.id, kinds, worker.endpoint);
        for capability in &worker.capabilities {
            println!("    - {}", capability);
        }
    }
    Ok(())
}
