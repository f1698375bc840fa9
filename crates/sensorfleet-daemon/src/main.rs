//! Sensorfleet Daemon - Main entry point
//!
//! Discovers devices on the local subnet, keeps one agent per valid device,
//! and publishes their readings to the message bus.

mod agent;
mod bridge;
mod bus;
mod config;
mod state;
mod supervisor;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use clap::Parser;
use sensorfleet_core::{Directory, MemoryStore};
use sensorfleet_discovery::DiscoveryScanner;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "sensorfleet")]
#[command(about = "Sensor fleet discovery and telemetry daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sensorfleet.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single scan, print the neighbors found, and exit
    #[arg(long)]
    scan_once: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", config::default_config_toml()?);
        return Ok(());
    }

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Sensorfleet v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;

    info!(
        interface = %config.discovery.interface,
        prefix = config.discovery.prefix_len,
        bus = %config.bus.url,
        credentials = config.credentials.len(),
        "Configuration loaded"
    );

    if args.scan_once {
        // Throwaway directory, nothing is persisted
        let directory = Directory::load(Arc::new(MemoryStore::new())).await;
        let scanner = DiscoveryScanner::new(config.to_scanner_config(), directory);
        let found = scanner.scan_once().await?;
        println!("Discovered {} devices:", found.len());
        for (id, ip) in found {
            println!("  - {} at {}", id, ip);
        }
        return Ok(());
    }

    let state = state::AppState::new(&config).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_cancel.cancel();
    });

    state.run(cancel).await;
    Ok(())
}
