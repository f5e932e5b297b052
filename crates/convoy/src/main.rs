//! Convoy binary: JSON-lines events on stdin, dispatch requests on stdout.
//!
//! ```bash
//! convoy run --config convoy.yaml
//! convoy check-config --config convoy.yaml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use convoy::config::Config;
use convoy::dedup::DedupLedger;
use convoy::dispatch::{FlushEmitter, JsonLinesDispatcher};
use convoy::identity::{Credentials, StaticIdentityProbe};
use convoy::supervisor::ConnectionSupervisor;
use convoy::transport::JsonLinesTransport;
use convoy::trigger::TriggerRegistry;
use convoy::BatchEngine;

#[derive(Parser, Debug)]
#[command(name = "convoy", version)]
#[command(about = "Batch chat messages and hand them to an agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read events from stdin and write dispatch requests to stdout
    Run {
        /// Path to the YAML config file
        #[arg(long, default_value = "convoy.yaml")]
        config: PathBuf,

        /// Log filter, overrides RUST_LOG
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Load and validate a config file, then print the effective settings
    CheckConfig {
        #[arg(long, default_value = "convoy.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_level } => {
            init_tracing(log_level.as_deref());
            run(config).await
        }
        Command::CheckConfig { config } => check_config(config).await,
    }
}

fn init_tracing(level: Option<&str>) {
    // stdout carries dispatch output, so logs go to stderr.
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .await
        .with_context(|| format!("failed to load config from {}", path.display()))
}

async fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path).await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn run(path: PathBuf) -> Result<()> {
    let config = load_config(&path).await?;
    info!(config = %path.display(), "Starting convoy");

    let emitter = FlushEmitter::new(Arc::new(JsonLinesDispatcher::stdout()));
    let engine = BatchEngine::new(
        config.batch_settings(),
        TriggerRegistry::from_config(&config.triggers),
        emitter,
    );
    let supervisor = ConnectionSupervisor::new(
        Arc::new(JsonLinesTransport::stdin()),
        Arc::new(StaticIdentityProbe::from_config(&config.identity)),
        engine,
        DedupLedger::new(config.dedup_settings()),
    )
    .with_credentials(Credentials::from(&config.credentials))
    .with_backoff(config.backoff_policy())
    .with_idle_prune(Duration::from_secs(config.connection.batch_idle_prune_seconds));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
            }
        }
    });

    supervisor.run(cancel).await?;
    Ok(())
}
