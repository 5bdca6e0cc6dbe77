// Publish Gate - Main Entry Point
//
// Runs the admission-controlled posting queue:
// - Per-platform rate limit windows with burst overrides
// - Retrying dispatch loops, one per configured platform
// - Admin HTTP API with SLO health and Prometheus metrics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use publish_gate::clock::SystemClock;
use publish_gate::config::Config;
use publish_gate::gate::{build_clients, build_store, GateSettings, PublishGate};
use publish_gate::metrics;
use publish_gate::server::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Publish Gate: rate-limited outbound publishing
#[derive(Parser, Debug)]
#[command(name = "publish-gate")]
#[command(author = "Publish Gate Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Per-platform admission control and retrying publish queue", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the dispatch loops and the admin API
    Serve {
        /// Override the listen address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config, args.verbose)?;

    match args.command {
        Some(Commands::Serve { bind }) => serve(config, bind).await?,
        Some(Commands::CheckConfig) => check_config(&config)?,
        None => {
            println!("No command specified. Use \"publish-gate --help\" for usage.");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("Configuration OK");
    println!("{}", rendered);
    Ok(())
}

async fn serve(config: Config, bind: Option<String>) -> Result<()> {
    info!("Publish Gate v{} starting...", env!("CARGO_PKG_VERSION"));

    if config.metrics.enabled {
        metrics::init().context("Failed to initialize metrics")?;
    }

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid listen address: {}", bind))?;

    let clients = build_clients(&config);
    if clients.is_empty() {
        warn!("No platform clients configured; nothing will be dispatched");
    }
    let store = build_store(&config).await?;

    let gate = PublishGate::open(
        GateSettings::from(&config),
        store,
        Arc::new(SystemClock),
        clients,
    )
    .await
    .context("Failed to open publish gate")?;
    gate.start().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let state = AppState {
        gate: Arc::clone(&gate),
        metrics_enabled: config.metrics.enabled,
    };
    let result = server::serve(addr, state, shutdown_rx).await;

    gate.shutdown().await;
    result
}
