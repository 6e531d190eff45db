//! hwlink Exporter Daemon
//!
//! Instantiates the configured driver tree and serves it to clients on the
//! configured endpoint and any alternative TLS endpoints.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hwl_client::ChannelOptions;
use hwl_core::config::{self, ExporterConfig};
use hwl_core::Address;
use hwl_exporter::{DriverRegistry, ExporterServer};

#[derive(Parser)]
#[command(name = "hwl-exporter")]
#[command(about = "hwlink exporter daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint to serve on, `tcp://host:port` or `unix:///path` (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("hwlink exporter starting...");

    // Load configuration
    let config: ExporterConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_exporter_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ExporterConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ExporterConfig::default()
        }
    };

    let endpoint: Address = args
        .endpoint
        .as_deref()
        .unwrap_or(&config.endpoint)
        .parse()
        .context("Invalid exporter endpoint")?;

    // Build the driver tree; external mounts connect here
    let registry = DriverRegistry::with_builtins().with_mount_options(ChannelOptions {
        connect_timeout: config.connect_timeout,
        call_timeout: None,
    });
    let root = registry
        .instantiate_root(&config.export)
        .await
        .context("Failed to instantiate drivers")?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let server = ExporterServer::start(root, &config.alternative_endpoints, cancel.clone())
        .await
        .context("Failed to start exporter")?;

    tracing::info!("Starting exporter on {}", endpoint);
    let result = server.serve(&endpoint).await;

    server.session().close().await;
    result?;

    tracing::info!("Exporter shutdown complete");
    Ok(())
}
